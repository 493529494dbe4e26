//! Round-trip tests for the wire codec
//!
//! Covers the edge values the sync layer actually produces: null and empty
//! strings, null and empty sequences, the nil UUID, zero and negative
//! durations, and the playback format descriptor.

use chrono::TimeDelta;
use tremolo_common::codec::{WireReader, WireWriter};
use tremolo_common::model::{AudioFormat, Song};
use uuid::Uuid;

#[test]
fn test_string_edge_values_round_trip() {
    for value in [None, Some(String::new()), Some("Käse & Brot".to_owned())] {
        let mut w = WireWriter::new();
        w.push_opt_string(value.as_deref());
        let buf = w.into_vec();
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_opt_string().unwrap(), value);
        assert_eq!(r.remaining(), 0);
    }
}

#[test]
fn test_uuid_round_trip_including_nil() {
    for value in [Uuid::nil(), Uuid::new_v4()] {
        let mut w = WireWriter::new();
        w.push_uuid(value);
        let buf = w.into_vec();
        assert_eq!(buf.len(), 16);
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_uuid().unwrap(), value);
    }
}

#[test]
fn test_duration_round_trip_zero_and_negative() {
    for value in [
        TimeDelta::zero(),
        TimeDelta::seconds(-3),
        TimeDelta::milliseconds(4 * 60 * 1000 + 250),
    ] {
        let mut w = WireWriter::new();
        w.push_delta(value);
        let buf = w.into_vec();
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_delta().unwrap(), value);
    }
}

#[test]
fn test_song_round_trip_with_and_without_tags() {
    let songs = [
        Song::new(3, Some("Title"), Some("Artist"), "/music/a.flac"),
        Song::new(0, None, None, "/music/untagged.mp3"),
    ];
    for song in &songs {
        let mut w = WireWriter::new();
        w.push_song(song);
        let buf = w.into_vec();
        let mut r = WireReader::new(&buf);
        let decoded = r.read_song().unwrap();
        assert_eq!(&decoded, song);
        assert_eq!(decoded.index, song.index);
    }
}

#[test]
fn test_song_sequence_null_empty_and_filled() {
    let filled = vec![
        Song::new(0, Some("A"), Some("X"), "/a"),
        Song::new(1, Some("B"), None, "/b"),
    ];
    for value in [None, Some(Vec::new()), Some(filled)] {
        let mut w = WireWriter::new();
        w.push_songs(value.as_deref());
        let buf = w.into_vec();
        let mut r = WireReader::new(&buf);
        assert_eq!(r.read_songs().unwrap(), value);
    }
}

#[test]
fn test_string_sequence_round_trip() {
    let value = Some(vec!["/media/usb".to_owned(), "/home/user/Music".to_owned()]);
    let mut w = WireWriter::new();
    w.push_strings(value.as_deref());
    let buf = w.into_vec();
    let mut r = WireReader::new(&buf);
    assert_eq!(r.read_strings().unwrap(), value);
}

#[test]
fn test_audio_format_round_trip() {
    let format = AudioFormat {
        sample_rate: 44_100,
        channels: 2,
        bits_per_sample: 16,
        block_align: 4,
        avg_bytes_per_sec: 176_400,
        encoding: 1,
    };
    let mut w = WireWriter::new();
    w.push_audio_format(&format);
    let buf = w.into_vec();
    let mut r = WireReader::new(&buf);
    assert_eq!(r.read_audio_format().unwrap(), format);
    assert_eq!(r.remaining(), 0);
}

#[test]
fn test_mixed_payload_is_positional() {
    // No tags, no versioning: order alone carries meaning.
    let mut w = WireWriter::new();
    w.push_bool(true);
    w.push_uuid(Uuid::nil());
    w.push_delta(TimeDelta::seconds(30));
    let buf = w.into_vec();

    let mut r = WireReader::new(&buf);
    assert!(r.read_bool().unwrap());
    assert_eq!(r.read_uuid().unwrap(), Uuid::nil());
    assert_eq!(r.read_delta().unwrap(), TimeDelta::seconds(30));
    assert_eq!(r.remaining(), 0);
}
