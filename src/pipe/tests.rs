use super::*;
use std::thread;
use std::time::Duration;

#[test]
fn write_then_read_round_trip() {
    let pipe = DataStreamPipe::new(16);
    let (reader, writer) = pipe.split();
    writer.write(b"hello").unwrap();
    let mut buf = [0u8; 5];
    reader.read_fully(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");
}

#[test]
fn read_blocks_until_data_then_returns_available() {
    let pipe = DataStreamPipe::new(16);
    let (reader, writer) = pipe.split();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 10];
        reader.read(&mut buf).unwrap()
    });
    thread::sleep(Duration::from_millis(20));
    writer.write(b"abc").unwrap();
    let n = handle.join().unwrap();
    assert_eq!(n, 3);
}

#[test]
fn write_blocks_until_capacity_available() {
    let pipe = DataStreamPipe::new(4);
    let (reader, writer) = pipe.split();
    writer.write(b"abcd").unwrap();
    let handle = thread::spawn(move || {
        writer.write(b"ef").unwrap();
    });
    thread::sleep(Duration::from_millis(20));
    let mut buf = [0u8; 2];
    reader.read_fully(&mut buf).unwrap();
    handle.join().unwrap();
    assert_eq!(reader.available(), 4);
}

#[test]
fn close_unblocks_waiting_reader_with_error() {
    let pipe = DataStreamPipe::new(16);
    let (reader, writer) = pipe.split();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 4];
        reader.read(&mut buf)
    });
    thread::sleep(Duration::from_millis(20));
    writer.close();
    assert_eq!(handle.join().unwrap(), Err(PipeError::Closed));
}

#[test]
fn buffered_reads_succeed_after_close_but_blocking_reads_fail() {
    let pipe = DataStreamPipe::new(16);
    let (reader, writer) = pipe.split();
    writer.write(b"xy").unwrap();
    writer.close();

    let mut buf = [0u8; 2];
    reader.read_fully(&mut buf).unwrap();
    assert_eq!(&buf, b"xy");

    let mut buf = [0u8; 1];
    assert_eq!(reader.read(&mut buf), Err(PipeError::Closed));
}

#[test]
fn writes_fail_once_closed() {
    let pipe = DataStreamPipe::new(16);
    let (_reader, writer) = pipe.split();
    writer.close();
    assert_eq!(writer.write(b"z"), Err(PipeError::Closed));
}

#[test]
fn wait_for_available_bytes_unblocks_at_threshold() {
    let pipe = DataStreamPipe::new(16);
    let (reader, writer) = pipe.split();
    let handle = thread::spawn(move || reader.wait_for_available_bytes(3));
    thread::sleep(Duration::from_millis(10));
    writer.write(b"a").unwrap();
    thread::sleep(Duration::from_millis(10));
    writer.write(b"bc").unwrap();
    handle.join().unwrap().unwrap();
}

#[test]
fn timeout_wait_returns_false_instead_of_blocking_forever() {
    let pipe = DataStreamPipe::new(16);
    let (reader, _writer) = pipe.split();
    let unblocked = reader.wait_for_available_bytes_timeout(1, Duration::from_millis(20)).unwrap();
    assert!(!unblocked);
}

#[test]
fn timeout_wait_reports_closed_even_under_a_timeout_budget() {
    let pipe = DataStreamPipe::new(16);
    let (reader, writer) = pipe.split();
    writer.close();
    assert_eq!(reader.wait_for_available_bytes_timeout(1, Duration::from_millis(20)), Err(PipeError::Closed));
}
