use serde_json::{Map, Value};

/// Expand environment variables in a string.
/// Supports ${VAR_NAME}, ${VAR:-default} and $VAR_NAME syntax.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }
        if chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            if let Some((name, default)) = var_name.split_once(":-") {
                match std::env::var(name) {
                    Ok(val) if !val.is_empty() => result.push_str(&val),
                    _ => result.push_str(default),
                }
            } else if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            }
        } else {
            // $VAR_NAME (terminated by non-alphanumeric/underscore)
            let mut var_name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' {
                    var_name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if var_name.is_empty() {
                result.push('$');
            } else if let Ok(val) = std::env::var(&var_name) {
                result.push_str(&val);
            }
        }
    }
    result
}

/// 深度合并：两边都是对象时递归，否则 overlay 覆盖 base
pub fn merge_json(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_json(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expand_env_var_braces() {
        std::env::set_var("TEST_COREWARDEN_VAR", "hello");
        let result = expand_env_vars("value=${TEST_COREWARDEN_VAR}");
        assert_eq!(result, "value=hello");
        std::env::remove_var("TEST_COREWARDEN_VAR");
    }

    #[test]
    fn expand_env_var_no_braces() {
        std::env::set_var("TEST_CW_PORT", "8080");
        let result = expand_env_vars("port=$TEST_CW_PORT end");
        assert_eq!(result, "port=8080 end");
        std::env::remove_var("TEST_CW_PORT");
    }

    #[test]
    fn expand_env_var_default() {
        std::env::remove_var("TEST_CW_MISSING");
        let result = expand_env_vars("val=${TEST_CW_MISSING:-default_value}");
        assert_eq!(result, "val=default_value");
    }

    #[test]
    fn expand_env_var_undefined_empty() {
        std::env::remove_var("TEST_CW_UNDEFINED");
        assert_eq!(expand_env_vars("val=${TEST_CW_UNDEFINED}"), "val=");
    }

    #[test]
    fn expand_dollar_sign_alone() {
        assert_eq!(expand_env_vars("price is $"), "price is $");
    }

    #[test]
    fn merge_nested_objects() {
        let mut base = json!({
            "type": "vmess",
            "tls": { "enabled": true, "server_name": "a.com" },
            "alpn": ["h2"]
        });
        let overlay = json!({
            "tls": { "server_name": "b.com", "insecure": true },
            "alpn": ["http/1.1"]
        });
        merge_json(
            base.as_object_mut().unwrap(),
            overlay.as_object().unwrap(),
        );
        assert_eq!(
            base,
            json!({
                "type": "vmess",
                "tls": { "enabled": true, "server_name": "b.com", "insecure": true },
                "alpn": ["http/1.1"]
            })
        );
    }

    #[test]
    fn merge_replaces_non_object_with_object() {
        let mut base = json!({ "detour": "x" });
        let overlay = json!({ "detour": { "a": 1 } });
        merge_json(base.as_object_mut().unwrap(), overlay.as_object().unwrap());
        assert_eq!(base["detour"]["a"], 1);
    }
}
