//! Nick and ident grammar: validation, coercion and sanitising.
//!
//! These are pure functions; the session decides whether to coerce or to
//! surface an error depending on whether the nick came from configuration
//! (coerce) or from an explicit user command (strict).

use thiserror::Error;

/// A nick failed strict validation. The message is short and safe to show
/// to the user who requested the nick.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct InvalidNickError(pub String);

/// Characters legal anywhere in a nick (RFC 2812 sect 2.3.1).
fn is_nick_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}' | '-')
}

/// Characters a nick may start with: letters and specials, but not digits
/// and not dash.
fn is_nick_start(c: char) -> bool {
    c.is_ascii_alphabetic() || matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}')
}

/// Cheap structural check used before paying for processing on a
/// purported nick (e.g. a PM recipient).
pub fn is_valid_nick_start(nick: &str) -> bool {
    nick.chars().next().is_some_and(is_nick_start)
}

/// Convert `nick` into a valid nick, or reject it.
///
/// Stripping and prefixing only happen in lenient mode; in strict mode any
/// required modification is an error with a human-readable message. Length
/// is only enforced when the connected network advertised NICKLEN: real
/// IRCds coerce overlong nicks rather than rejecting the connection, so
/// unconnected validation is optimistic.
pub fn valid_nick(
    nick: &str,
    strict: bool,
    max_len: Option<usize>,
) -> Result<String, InvalidNickError> {
    let mut n: String = nick.chars().filter(|&c| is_nick_char(c)).collect();
    if strict && n != nick {
        return Err(InvalidNickError(format!(
            "Nick '{nick}' contains illegal characters."
        )));
    }

    if !n.chars().next().is_some_and(is_nick_start) {
        if strict {
            return Err(InvalidNickError(format!(
                "Nick '{nick}' must start with a letter or special character \
                 (dash is not a special character)."
            )));
        }
        // Arbitrary letter prefix. Important for guest user ids, which are
        // all digits.
        n.insert(0, 'M');
    }

    if let Some(max_len) = max_len
        && n.len() > max_len
    {
        if strict {
            return Err(InvalidNickError(format!(
                "Nick '{nick}' is too long. (Max: {max_len})"
            )));
        }
        n.truncate(max_len);
    }

    Ok(n)
}

/// Strip a username down to the IRC-legal charset, lowercased. `_` is also
/// stripped because the ident generator reserves it as its collision
/// suffix delimiter. Usernames starting with a special character get an
/// `M` prefix; some IRCds reject them outright ("Invalid username").
pub fn sanitise_username(username: &str) -> String {
    let stripped: String = username
        .to_lowercase()
        .chars()
        .filter(|&c| {
            c.is_ascii_alphanumeric() || matches!(c, '[' | ']' | '^' | '\\' | '{' | '}' | '-' | '`')
        })
        .collect();
    if stripped.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
        stripped
    } else {
        format!("M{stripped}")
    }
}

/// Realnames can be any old ASCII.
pub fn sanitise_realname(realname: &str) -> String {
    realname.chars().filter(char::is_ascii).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_nick_is_idempotent() {
        let coerced = valid_nick("M-alice[m]", false, None).unwrap();
        assert_eq!(valid_nick(&coerced, false, None).unwrap(), coerced);
        assert_eq!(valid_nick("alice", true, None).unwrap(), "alice");
    }

    #[test]
    fn strips_illegal_characters_when_lenient() {
        assert_eq!(valid_nick("al ice!", false, None).unwrap(), "alice");
    }

    #[test]
    fn strict_mode_rejects_illegal_characters() {
        let err = valid_nick("al ice", true, None).unwrap_err();
        assert!(err.0.contains("illegal characters"));
    }

    #[test]
    fn digit_start_gets_letter_prefix() {
        assert_eq!(valid_nick("12345", false, None).unwrap(), "M12345");
        assert!(valid_nick("12345", true, None).is_err());
    }

    #[test]
    fn dash_is_not_a_valid_start() {
        assert_eq!(valid_nick("-dash", false, None).unwrap(), "M-dash");
    }

    #[test]
    fn truncates_to_advertised_nicklen() {
        assert_eq!(
            valid_nick("averylongnickname", false, Some(9)).unwrap(),
            "averylong"
        );
        assert!(valid_nick("averylongnickname", true, Some(9)).is_err());
        // no length check when the network never advertised one
        assert_eq!(
            valid_nick("averylongnickname", false, None).unwrap(),
            "averylongnickname"
        );
    }

    #[test]
    fn sanitises_usernames() {
        assert_eq!(sanitise_username("Alice_Smith"), "alicesmith");
        assert_eq!(sanitise_username("foobar££stuff"), "foobarstuff");
        assert_eq!(sanitise_username("-leading"), "M-leading");
        assert_eq!(sanitise_username("9lives"), "M9lives");
    }

    #[test]
    fn sanitises_realnames_to_ascii() {
        assert_eq!(sanitise_realname("Ålice @ home"), "lice @ home");
    }
}
