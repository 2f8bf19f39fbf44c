use iorate::{MeasuredWriter, ThrottledReader, ThrottledWriter, KiB};
use rand::RngCore;
use std::{
    io::{self, Read, Write},
    time::{Duration, Instant},
};

const RATE: u64 = 100 * KiB;
const RESOLUTION: Duration = Duration::from_millis(10);

fn random_input(len: usize) -> Vec<u8> {
    let mut input = vec![0; len];
    rand::thread_rng().fill_bytes(&mut input);
    input
}

#[test]
fn reader_keeps_rate() {
    // 10 windows of 1 KiB, the first one needs no wait
    let input = random_input(10 * KiB as usize);
    let mut reader = ThrottledReader::new(input.as_slice(), RATE, RESOLUTION);

    let started = Instant::now();
    let mut output = Vec::new();
    reader.read_to_end(&mut output).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(output, input);
    assert!(elapsed >= Duration::from_millis(80), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300), "{:?}", elapsed);
}

#[test]
fn writer_keeps_rate() {
    let input = random_input(10 * KiB as usize);
    let mut writer = ThrottledWriter::new(Vec::new(), RATE, RESOLUTION);

    let started = Instant::now();
    writer.write_all(&input).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(writer.into_inner(), input);
    assert!(elapsed >= Duration::from_millis(80), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(300), "{:?}", elapsed);
}

#[test]
fn throttled_over_measured() {
    let mut writer = ThrottledWriter::new(MeasuredWriter::new(io::sink()), RATE, RESOLUTION);
    let meter = writer.get_ref().meter();

    // starts the measuring window
    writer.write_all(&[0; 1]).unwrap();
    meter.bytes_per_sec();

    writer.write_all(&[0; 20 * KiB as usize]).unwrap();
    let rate = meter.bytes_per_sec();

    assert_eq!(meter.total(), 20 * KiB + 1);
    assert!(rate <= RATE * 13 / 10, "{} B/s", rate);
}
