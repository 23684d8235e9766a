use crate::e2e::*;

#[test]
fn manual_edit_is_quarantined() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[CAT_RULE]))?;
    space.write("hello", "hello\n")?;
    space.write("world", "world\n")?;
    space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;

    space.rewrite("hello+world", "edited by hand\n")?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "manual hello+world\n");
    assert_output_contains(&out, "quarantine hello+world\n");
    // The rerun gives back what the job last produced.
    assert_output_contains(&out, "steady hello+world\n");
    assert_output_not_contains(&out, "done hello+world");
    assert_eq!(space.read("hello+world")?, b"hello\nworld\n");
    assert_eq!(
        space.read(".dynmake/quarantine/hello+world")?,
        b"edited by hand\n"
    );
    Ok(())
}

#[test]
fn manual_edit_with_changed_source_is_done() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[CAT_RULE]))?;
    space.write("hello", "hello\n")?;
    space.write("world", "world\n")?;
    space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;

    space.rewrite("hello+world", "edited by hand\n")?;
    space.rewrite("hello", "bonjour\n")?;
    let out = space.run_expect(&mut dynmake_command(vec!["hello+world"]))?;
    assert_output_contains(&out, "manual hello+world\n");
    assert_output_contains(&out, "quarantine hello+world\n");
    assert_output_contains(&out, "done hello+world\n");
    assert_eq!(space.read("hello+world")?, b"bonjour\nworld\n");
    Ok(())
}

#[test]
fn unlisted_file_is_dangling() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&format!(
        "{{\"sources\": [\"hello\"], \"rules\": [{}]}}",
        CAT_RULE
    ))?;
    space.write("hello", "hello\n")?;
    space.write("stray", "stray\n")?;
    let out = space.run_fail(&mut dynmake_command(vec!["hello+stray"]))?;
    assert_output_contains(&out, "dangling stray\n");
    assert_output_contains(&out, "dep_err hello+stray\n");
    Ok(())
}

#[test]
fn ambiguous_rules_fail() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[
        r#"{"name": "one", "targets": {"out": "x"}, "cmd": "echo 1 > {out}",
            "attrs": {"autodep": "none"}}"#,
        r#"{"name": "two", "targets": {"out": "x"}, "cmd": "echo 2 > {out}",
            "attrs": {"autodep": "none"}}"#,
    ]))?;
    space.run_fail(&mut dynmake_command(vec!["x"]))?;
    assert!(!space.exists("x"));
    Ok(())
}

#[test]
fn higher_priority_wins() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[
        r#"{"name": "one", "prio": 1, "targets": {"out": "x"}, "cmd": "echo 1 > {out}",
            "attrs": {"autodep": "none"}}"#,
        r#"{"name": "two", "targets": {"out": "x"}, "cmd": "echo 2 > {out}",
            "attrs": {"autodep": "none"}}"#,
    ]))?;
    space.run_expect(&mut dynmake_command(vec!["x"]))?;
    assert_eq!(space.read("x")?, b"1\n");
    Ok(())
}

#[test]
fn stdout_target() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.rules(&rules(&[
        r#"{"name": "greet", "target": "greeting", "cmd": "echo hi",
            "attrs": {"autodep": "none"}}"#,
    ]))?;
    let out = space.run_expect(&mut dynmake_command(vec!["greeting"]))?;
    assert_output_contains(&out, "done greeting\n");
    assert_eq!(space.read("greeting")?, b"hi\n");
    Ok(())
}
