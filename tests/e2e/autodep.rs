//! Deps discovered by watching the job, without any declaration.  Sandboxes
//! may forbid ptrace and the preload library may not be built; the tests
//! then have nothing to check.

use crate::e2e::*;

fn watched(method: &str) -> anyhow::Result<Option<TestSpace>> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[&format!(
        r#"{{"name": "copy", "targets": {{"out": "copy"}},
            "cmd": "cat hello > {{out}}", "attrs": {{"autodep": "{}"}}}}"#,
        method
    )]))?;
    space.write("hello", "hello\n")?;
    let out = space.run_expect(&mut dynmake_command(vec!["copy"]))?;
    assert_output_contains(&out, "done copy\n");
    if !String::from_utf8_lossy(&out.stdout).contains("new hello\n") {
        return Ok(None);
    }
    Ok(Some(space))
}

fn rebuilds_on_read_change(method: &str) -> anyhow::Result<()> {
    let Some(space) = watched(method)? else {
        return Ok(());
    };
    let out = space.run_expect(&mut dynmake_command(vec!["copy"]))?;
    assert_output_not_contains(&out, "done");

    space.rewrite("hello", "bonjour\n")?;
    let out = space.run_expect(&mut dynmake_command(vec!["copy"]))?;
    assert_output_contains(&out, "changed hello\n");
    assert_output_contains(&out, "done copy\n");
    assert_eq!(space.read("copy")?, b"bonjour\n");
    Ok(())
}

#[test]
fn ptrace() -> anyhow::Result<()> {
    rebuilds_on_read_change("ptrace")
}

#[test]
fn ld_preload() -> anyhow::Result<()> {
    rebuilds_on_read_change("ld_preload")
}

#[test]
fn read_of_a_buildable_file_builds_it_first() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[
        CAT_RULE,
        r#"{"name": "upper", "targets": {"out": "upper"},
            "cmd": "tr a-z A-Z < hello+world > {out}", "attrs": {"autodep": "ptrace"}}"#,
    ]))?;
    space.write("hello", "hello\n")?;
    space.write("world", "world\n")?;
    let out = space.run(&mut dynmake_command(vec!["upper"]))?;
    if !String::from_utf8_lossy(&out.stdout).contains("done hello+world\n") {
        // Not watched: the read went unnoticed.
        return Ok(());
    }
    assert!(out.status.success());
    assert_eq!(space.read("upper")?, b"HELLO\nWORLD\n");
    Ok(())
}
