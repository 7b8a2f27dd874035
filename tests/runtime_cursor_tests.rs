//! Crawl-shaped exercises of the persistent page-cursor store: the sequence
//! of stack operations a source goes through across a crawl, a restart, and
//! a refresh cycle.

use image_spider::infrastructure::cursor::CursorStore;

#[test]
fn crawl_cycle_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtimeConfig.yaml");

    {
        let store = CursorStore::load(&path);
        // Startup seeds page zero; first run walks pages 1 and 2.
        store.append_stack("demo", 0);
        assert_eq!(store.stack_top("demo"), Some(0));
        store.replace_stack_top("demo", 1);
        store.replace_stack_top("demo", 2);
    }

    // Crash here: a fresh process resumes from the recorded page.
    let store = CursorStore::load(&path);
    assert_eq!(store.stack_top("demo"), Some(2));

    // The run finishes: pop empties the stack, refresh seeds zero again.
    assert_eq!(store.stack_pop("demo"), Some(2));
    assert_eq!(store.stack_top("demo"), None);
    store.append_stack("demo", 0);
    store.append_stack("demo", 0);
    assert_eq!(store.stack_pop("demo"), Some(0));
    assert_eq!(store.stack_pop("demo"), None);
}

#[test]
fn on_disk_format_is_versioned_yaml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtimeConfig.yaml");

    let store = CursorStore::load(&path);
    store.append_stack("alpha", 0);
    store.replace_stack_top("alpha", 9);
    store.append_stack("beta", 0);

    let raw = std::fs::read_to_string(&path).unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
    assert_eq!(doc["version"], "v1");
    assert_eq!(doc["lastFetchPageStack"]["alpha"][0], 9);
    assert_eq!(doc["lastFetchPageStack"]["beta"][0], 0);
}

#[test]
fn sources_do_not_interfere() {
    let dir = tempfile::tempdir().unwrap();
    let store = CursorStore::load(dir.path().join("runtimeConfig.yaml"));

    store.append_stack("one", 0);
    store.append_stack("two", 0);
    store.replace_stack_top("one", 5);
    assert_eq!(store.stack_top("one"), Some(5));
    assert_eq!(store.stack_top("two"), Some(0));
    store.stack_pop("two");
    assert_eq!(store.stack_top("one"), Some(5));
}
