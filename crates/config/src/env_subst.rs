/// Replace `${ENV_VAR}` placeholders in config string values.
///
/// `${ENV_VAR:-fallback}` uses `fallback` when the variable is unset.
/// Unresolvable variables without a fallback are left as-is.
pub fn substitute_env(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' || chars.peek() != Some(&'{') {
            result.push(ch);
            continue;
        }
        chars.next(); // consume '{'

        let mut body = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == '}' {
                closed = true;
                break;
            }
            body.push(c);
        }

        if !closed || body.is_empty() {
            // Malformed, emit literal.
            result.push_str("${");
            result.push_str(&body);
            continue;
        }

        let (name, fallback) = match body.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (body.as_str(), None),
        };

        match (std::env::var(name), fallback) {
            (Ok(val), _) => result.push_str(&val),
            (Err(_), Some(fallback)) => result.push_str(fallback),
            (Err(_), None) => {
                result.push_str("${");
                result.push_str(&body);
                result.push('}');
            },
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(unsafe_code)]
    fn substitutes_known_var() {
        unsafe { std::env::set_var("WEBIRC_TEST_CERT_DIR", "/etc/certs") };
        assert_eq!(
            substitute_env("cert = \"${WEBIRC_TEST_CERT_DIR}/gw.pem\""),
            "cert = \"/etc/certs/gw.pem\""
        );
        unsafe { std::env::remove_var("WEBIRC_TEST_CERT_DIR") };
    }

    #[test]
    fn leaves_unknown_var() {
        assert_eq!(
            substitute_env("${WEBIRC_NONEXISTENT_XYZ}"),
            "${WEBIRC_NONEXISTENT_XYZ}"
        );
    }

    #[test]
    fn unknown_var_uses_fallback() {
        assert_eq!(substitute_env("port = ${WEBIRC_NONEXISTENT_PORT:-8080}"), "port = 8080");
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        assert_eq!(substitute_env("bind = ${HOST"), "bind = ${HOST");
    }

    #[test]
    fn no_placeholders() {
        assert_eq!(substitute_env("plain $text"), "plain $text");
    }
}
