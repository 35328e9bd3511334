use agentmesh::utils::{is_clean_name, sanitize_name};

#[test]
fn spaces_become_underscores() {
    assert_eq!(sanitize_name("my agent"), "my_agent");
    assert_eq!(sanitize_name("a\tb c"), "a_b_c");
}

#[test]
fn edges_are_trimmed() {
    assert_eq!(sanitize_name("  temp  "), "temp");
    assert_eq!(sanitize_name(""), "");
}

#[test]
fn long_names_are_truncated() {
    let long = "x".repeat(5000);
    assert_eq!(sanitize_name(&long).len(), agentmesh::constants::MAX_NAME_LENGTH);
}

#[test]
fn clean_name_detection() {
    assert!(is_clean_name("temp"));
    assert!(!is_clean_name("my temp"));
    assert!(!is_clean_name(""));
}
