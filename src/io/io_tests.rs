use std::fs;

use crate::io::{
    npdm_file_stem, read_npdm_binary, read_npdm_yaml, write_npdm_binary, write_npdm_text,
    write_npdm_yaml, NpdmFileType,
};

#[test]
fn test_io_file_stem_keeps_state_labels() {
    let dir = tempfile::tempdir().unwrap();
    let stem = npdm_file_stem(dir.path(), 2, Some("spatial"), 0, 1);
    assert_eq!(
        stem.file_name().unwrap().to_str().unwrap(),
        "spatial_twopdm.0.1"
    );

    let values = vec![1.0, -2.5, 3.25];
    write_npdm_binary(&stem, NpdmFileType::Spatial, &values).unwrap();
    assert!(dir.path().join("spatial_twopdm.0.1.npdm.spatial.bin").exists());
    let read: Vec<f64> = read_npdm_binary(&stem, NpdmFileType::Spatial).unwrap();
    assert_eq!(read, values);
}

#[test]
fn test_io_text_rows() {
    let dir = tempfile::tempdir().unwrap();
    let stem = npdm_file_stem(dir.path(), 1, None, 0, 0);
    write_npdm_text(&stem, 4, vec![(vec![0, 1], 0.5), (vec![3, 3], -1.0)]).unwrap();
    let contents = fs::read_to_string(dir.path().join("onepdm.0.0.txt")).unwrap();
    let lines = contents.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "4");
    let last = lines[2].split_whitespace().collect::<Vec<_>>();
    assert_eq!(last[..2], ["3", "3"]);
    assert_eq!(last[2].parse::<f64>().unwrap(), -1.0);
}

#[test]
fn test_io_yaml_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let name = dir.path().join("values");
    write_npdm_yaml(&name, &vec![3usize, 1, 4]).unwrap();
    let read: Vec<usize> = read_npdm_yaml(dir.path().join("values.yml")).unwrap();
    assert_eq!(read, vec![3, 1, 4]);
}
