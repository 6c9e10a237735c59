use data_contracts::{load_classes, parse_label_file, LabelError, ObjectLabel};
use std::fs;

#[test]
fn valid_label_file_parses() {
    let text = "# class x y z h w l yaw\n\
                0 0.50 0.40 0.20 0.05 0.03 0.07 1.57\n\
                \n\
                2 0.10 0.90 0.15 0.04 0.01 0.03 -0.25\n";
    let labels = parse_label_file(text).unwrap();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[0].class_id, 0);
    assert_eq!(labels[1].class_id, 2);
    assert!((labels[1].yaw + 0.25).abs() < 1e-6);
}

#[test]
fn wrong_field_count_reports_line() {
    let text = "0 0.5 0.5 0.1 0.1 0.1 0.1 0.0\n1 0.5 0.5\n";
    let err = parse_label_file(text).unwrap_err();
    assert_eq!(err, LabelError::FieldCount { line: 2, found: 3 });
}

#[test]
fn out_of_range_centre_rejected() {
    let err = parse_label_file("0 1.5 0.5 0.1 0.1 0.1 0.1 0.0").unwrap_err();
    match err {
        LabelError::Invalid { line, source } => {
            assert_eq!(line, 1);
            assert!(matches!(*source, LabelError::CentreOutOfRange { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn zero_extent_rejected() {
    let label = ObjectLabel::parse_line("1 0.5 0.5 0.1 0.0 0.1 0.1 0.0", 1).unwrap();
    assert!(matches!(
        label.validate(),
        Err(LabelError::NonPositiveSize { .. })
    ));
}

#[test]
fn unparsable_number_names_field() {
    let err = ObjectLabel::parse_line("0 0.5 abc 0.1 0.1 0.1 0.1 0.0", 7).unwrap_err();
    assert_eq!(
        err,
        LabelError::Parse {
            line: 7,
            field: "y",
            raw: "abc".into()
        }
    );
}

#[test]
fn class_names_skip_blank_lines() -> std::io::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("classes.names");
    fs::write(&path, "Car\n\n  Pedestrian \nCyclist\n")?;
    let names = load_classes(&path)?;
    assert_eq!(names, vec!["Car", "Pedestrian", "Cyclist"]);
    Ok(())
}
