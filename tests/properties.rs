//! Property-based checks for the filter evaluator's monotonicity
//! invariants (spec §8 P2, P3), run over a fixed backing directory
//! with files carrying every combination of three tags.

use std::collections::BTreeSet;
use std::fs;

use proptest::prelude::*;
use tempfile::tempdir;

use beholdfs::filter::open_children;
use beholdfs::mutate;
use beholdfs::path::{parse_path, Filter};
use beholdfs::store::MetadataStore;
use beholdfs::config::Config;

const TAGS: [&str; 3] = ["a", "b", "c"];

fn build_fixture() -> tempfile::TempDir {
    let dir = tempdir().unwrap();
    let config = Config::default();
    // One file per non-empty subset of {a, b, c}, named after the subset.
    for mask in 1u8..8 {
        let tags: Vec<&str> = TAGS.iter().copied().filter(|t| mask & tag_bit(t) != 0).collect();
        let name = if tags.is_empty() { "none".to_string() } else { tags.join("") };
        fs::write(dir.path().join(&name), b"").unwrap();
        let tag_segments: String = tags.iter().map(|t| format!("%{t}/")).collect();
        let virtual_path = format!("/{tag_segments}{name}");
        let parsed = parse_path(&virtual_path, &config, false).unwrap();
        mutate::create(dir.path(), &parsed, beholdfs::store::schema::ObjectKind::File).unwrap();
    }
    dir
}

fn tag_bit(tag: &str) -> u8 {
    match tag {
        "a" => 1,
        "b" => 2,
        "c" => 4,
        _ => unreachable!(),
    }
}

fn visible_names(fsroot: &std::path::Path, filter: &Filter) -> BTreeSet<String> {
    let store = MetadataStore::open_read(fsroot).unwrap().unwrap();
    let root_id = store.root_id().unwrap();
    open_children(&store, root_id, filter).unwrap().into_iter().map(|c| c.name).collect()
}

fn tag_subset() -> impl Strategy<Value = Vec<String>> {
    proptest::collection::vec(prop::sample::select(&TAGS[..]), 0..=3).prop_map(|v| {
        let deduped: BTreeSet<String> = v.into_iter().map(|t| t.to_string()).collect();
        deduped.into_iter().collect::<Vec<String>>()
    })
}

proptest! {
    #[test]
    fn include_monotonicity(mut base in tag_subset(), extra in prop::sample::select(&TAGS[..])) {
        let dir = build_fixture();
        let before = Filter { include: base.clone(), exclude: vec![], listing: false };
        let before_names = visible_names(dir.path(), &before);

        base.retain(|t| t.as_str() != extra);
        base.push(extra.to_string());
        let after = Filter { include: base, exclude: vec![], listing: false };
        let after_names = visible_names(dir.path(), &after);

        prop_assert!(after_names.is_subset(&before_names));
    }

    #[test]
    fn exclude_monotonicity(mut base in tag_subset(), extra in prop::sample::select(&TAGS[..])) {
        let dir = build_fixture();
        let before = Filter { include: vec![], exclude: base.clone(), listing: false };
        let before_names = visible_names(dir.path(), &before);

        base.retain(|t| t.as_str() != extra);
        base.push(extra.to_string());
        let after = Filter { include: vec![], exclude: base, listing: false };
        let after_names = visible_names(dir.path(), &after);

        prop_assert!(after_names.is_subset(&before_names));
    }
}
