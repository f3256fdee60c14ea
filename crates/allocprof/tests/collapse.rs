use std::fs;
use std::process::Command;

fn allocprof() -> Command {
    Command::new(env!("CARGO_BIN_EXE_allocprof"))
}

#[test]
fn collapses_default_files_in_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("stacks.txt"),
        "# allocprof flame samples\n\
         app.main;app.work;app.work;byte 100\n\
         app.main;app.work;byte 50\n\
         onlyonefield\n",
    )
    .unwrap();

    let out = allocprof()
        .arg("collapse")
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Incomplete line(4): onlyonefield"));
    assert!(stdout.contains("Collapsed 4 rows into 1"));
    assert_eq!(
        fs::read_to_string(dir.path().join("collapsed.txt")).unwrap(),
        "app.main;app.work;byte; 150\n"
    );
}

#[test]
fn filter_argument_truncates_matching_stacks() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    let output = dir.path().join("out.txt");
    fs::write(&input, "a;b;c 5\nx;y;z 7\n").unwrap();

    let status = allocprof()
        .arg("collapse")
        .arg(&input)
        .arg("B")
        .arg("-o")
        .arg(&output)
        .status()
        .unwrap();
    assert!(status.success());
    assert_eq!(fs::read_to_string(&output).unwrap(), "b;c; 5\nx;y;z; 7\n");
}

#[test]
fn missing_input_exits_with_input_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let out = allocprof()
        .args(["collapse", "nope.txt"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&out.stderr).contains("nope.txt"));
    assert!(!dir.path().join("collapsed.txt").exists());
}

#[test]
fn unwritable_output_exits_with_write_failure() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("stacks.txt");
    fs::write(&input, "a;b 1\n").unwrap();

    let status = allocprof()
        .arg("collapse")
        .arg(&input)
        .arg("-o")
        .arg(dir.path().join("missing-dir").join("collapsed.txt"))
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(4));
}

#[test]
fn invalid_arguments_exit_with_two() {
    let status = allocprof()
        .args(["collapse", "--top", "0"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}
