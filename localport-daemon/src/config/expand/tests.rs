use super::*;

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn test_expand_simple_var() {
    let env = env(&[("NAMESPACE", "staging")]);
    assert_eq!(expand_with_env("${NAMESPACE}", &env), "staging");
}

#[test]
fn test_expand_with_default() {
    let env = env(&[]);
    assert_eq!(expand_with_env("${MISSING:-default}", &env), "default");
}

#[test]
fn test_expand_default_not_used_when_set() {
    let env = env(&[("CTX", "prod")]);
    assert_eq!(expand_with_env("${CTX:-minikube}", &env), "prod");
}

#[test]
fn test_unknown_var_left_untouched() {
    // Unresolvable references pass through so validation can report them
    let env = env(&[]);
    assert_eq!(expand_with_env("${NOPE}", &env), "${NOPE}");
}

#[test]
fn test_expand_yaml_nested() {
    let env = env(&[("HOST", "bastion.example.com")]);
    let mut value: serde_yaml::Value = serde_yaml::from_str(
        r#"
services:
  - name: tunnel
    connection:
      host: ${HOST}
      port: 22
"#,
    )
    .unwrap();
    expand_yaml_value(&mut value, &env);
    let rendered = serde_yaml::to_string(&value).unwrap();
    assert!(rendered.contains("bastion.example.com"));
    assert!(rendered.contains("port: 22"));
}
