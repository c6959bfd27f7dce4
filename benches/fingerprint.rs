//! Throughput benchmark for [`taskcache::Value::fingerprint`], mirroring
//! the teacher's `benches/` use of `divan` for hot-path measurement.

use taskcache::Value;

fn main() {
    divan::main();
}

#[divan::bench]
fn scalar_seq() -> Option<taskcache::Digest> {
    let seq = Value::Seq((0..64).map(Value::Int).collect());
    seq.fingerprint()
}

#[divan::bench]
fn nested_map() -> Option<taskcache::Digest> {
    let map = Value::Map(
        (0..64)
            .map(|i| (Value::from(format!("key-{i}")), Value::Int(i)))
            .collect(),
    );
    map.fingerprint()
}
