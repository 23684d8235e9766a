use criterion::{criterion_group, criterion_main, Criterion};
use dynmake::canon::canon_path;
use dynmake::rules::load;
use dynmake::rules::table::RuleTable;

/// A table shaped like a C project's: compile, link, archive, plus a few
/// dozen generators.
fn table() -> RuleTable {
    let mut rules = vec![
        r#"{"name": "cc", "stems": {"D": ".*", "F": "[^/]+"}, "targets": {"o": "{D}/{F}.o"},
            "deps": {"c": "{D}/{F}.c"}, "cmd": "cc -c {c} -o {o}"}"#
            .to_string(),
        r#"{"name": "link", "stems": {"D": ".*"}, "targets": {"exe": "{D}/a.out"},
            "cmd": "cc -o {exe}"}"#
            .to_string(),
        r#"{"name": "ar", "stems": {"D": ".*", "L": "[^/]+"}, "targets": {"a": "{D}/lib{L}.a"},
            "cmd": "ar rcs {a}"}"#
            .to_string(),
    ];
    for i in 0..50 {
        rules.push(format!(
            r#"{{"name": "gen{i}", "stems": {{"X": "[^/]+"}}, "targets": {{"h": "gen/{i}/{{X}}.h"}},
                "cmd": "gen {i} {{X}} > {{h}}"}}"#
        ));
    }
    let text = format!("{{\"rules\": [{}]}}", rules.join(","));
    load::parse(&text).expect("bench rules")
}

pub fn bench_matching(c: &mut Criterion) {
    let rules = table();

    c.bench_function("match object file", |b| {
        b.iter(|| rules.matches("src/support/lib/util/strings.o"))
    });

    c.bench_function("match generated header", |b| {
        b.iter(|| rules.matches("gen/42/config.h"))
    });

    c.bench_function("match source", |b| {
        b.iter(|| rules.matches("src/support/lib/util/strings.c"))
    });

    c.bench_function("canon with parents", |b| {
        b.iter(|| canon_path("src/support/lib/../../util/./strings.o"))
    });
}

criterion_group!(benches, bench_matching);
criterion_main!(benches);
