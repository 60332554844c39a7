use gcodestream_core::GcodeStreamReader;
use gcodestream_gcode::{FileStreamReader, GcodeParser, StringStreamReader};
use proptest::prelude::*;
use std::io::Write;

#[test]
fn test_file_reader_matches_string_reader() {
    let program = "G21\r\nG0 X1 Y1\r\n\r\n; done\r\nM2\r\n";
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(program.as_bytes()).unwrap();

    let mut from_file = FileStreamReader::open(file.path()).unwrap();
    let mut from_string = StringStreamReader::new(program);
    assert_eq!(from_file.num_rows(), 5);
    assert_eq!(from_file.num_rows(), from_string.num_rows());

    loop {
        let a = from_file.next_command().unwrap();
        let b = from_string.next_command().unwrap();
        match (a, b) {
            (Some(a), Some(b)) => {
                assert_eq!(a.text, b.text);
                assert_eq!(a.line_number, b.line_number);
            }
            (None, None) => break,
            other => panic!("readers diverged: {:?}", other),
        }
    }
}

#[test]
fn test_file_reader_start_row() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "G20").unwrap();
    writeln!(file, "G1 X1 F5").unwrap();
    writeln!(file, "G1 X2").unwrap();

    let mut reader = FileStreamReader::open(file.path()).unwrap();
    reader.start_from_row(3).unwrap();
    assert_eq!(reader.rows_remaining(), 1);
    assert_eq!(reader.preamble().as_deref(), Some("G20 G90 G17 G94 G54 F5"));
    let cmd = reader.next_command().unwrap().unwrap();
    assert_eq!(cmd.text, "G1 X2");
    assert_eq!(cmd.line_number, Some(3));
}

#[test]
fn test_file_reader_tolerates_latin1_comments() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"G21\n(Gr\xf6\xdfe 10mm)\r\nG0 X1").unwrap();

    let mut reader = FileStreamReader::open(file.path()).unwrap();
    assert_eq!(reader.num_rows(), 3);
    assert_eq!(reader.next_command().unwrap().unwrap().text, "G21");
    let comment = reader.next_command().unwrap().unwrap();
    assert_eq!(comment.line_number, Some(2));
    let last = reader.next_command().unwrap().unwrap();
    assert_eq!(last.text, "G0 X1");
    assert_eq!(last.line_number, Some(3));
    assert!(reader.next_command().unwrap().is_none());
}

#[test]
fn test_missing_file() {
    assert!(FileStreamReader::open("/nonexistent/program.nc").is_err());
}

proptest! {
    // Starting at row N leaves the same modal state as streaming rows 1..N
    #[test]
    fn prop_skipped_rows_track_modal_state(
        rows in proptest::collection::vec(
            prop_oneof![
                Just("G20"), Just("G21"), Just("G90"), Just("G91"),
                Just("G17"), Just("G18"), Just("G55"), Just("G1 X1 F100"),
                Just("G0 Z5"), Just("F250"), Just("(note)"), Just("S1000"),
            ],
            1..40,
        ),
        start in 1usize..40,
    ) {
        let program = rows.join("\n");
        let start = start.min(rows.len());
        let mut reader = StringStreamReader::new(&program);
        reader.start_from_row(start).unwrap();

        let mut parser = GcodeParser::new();
        for row in rows.iter().take(start - 1) {
            parser.process(row).unwrap();
        }

        if start == 1 {
            prop_assert!(reader.preamble().is_none());
        } else {
            prop_assert_eq!(reader.preamble(), Some(parser.preamble()));
        }
        prop_assert_eq!(reader.rows_remaining(), rows.len() - (start - 1));
    }
}
