//! ISUPPORT (RPL_ISUPPORT, 005) tracking.
//!
//! The bridge cares about three advertisements: PREFIX (who counts as an
//! operator, and the power ordering of status prefixes), NICKLEN (how far
//! to truncate coerced nicks) and CASEMAPPING (how to case-fold channel
//! and nick comparisons).

/// Server casemapping rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseMapping {
    /// `[]\~` are the uppercase forms of `{}|^`.
    #[default]
    Rfc1459,
    /// Like rfc1459 but without `~`/`^`.
    StrictRfc1459,
    Ascii,
}

/// Tracked ISUPPORT state for one connection.
#[derive(Debug, Clone)]
pub struct Isupport {
    /// (mode letter, status prefix) pairs, most powerful first.
    prefixes: Vec<(char, char)>,
    nicklen: Option<usize>,
    casemapping: CaseMapping,
}

impl Default for Isupport {
    fn default() -> Self {
        Self {
            // RFC 1459 baseline until the server advertises otherwise.
            prefixes: vec![('o', '@'), ('v', '+')],
            nicklen: None,
            casemapping: CaseMapping::default(),
        }
    }
}

impl Isupport {
    /// Apply the tokens of one 005 line. The leading target nick and the
    /// trailing "are supported by this server" text must already be
    /// stripped by the caller.
    pub fn apply_tokens<'a>(&mut self, tokens: impl IntoIterator<Item = &'a str>) {
        for token in tokens {
            let (key, value) = match token.split_once('=') {
                Some((k, v)) => (k, v),
                None => continue,
            };
            match key {
                "PREFIX" => {
                    if let Some(prefixes) = parse_prefix(value) {
                        self.prefixes = prefixes;
                    }
                }
                "NICKLEN" => {
                    self.nicklen = value.parse().ok();
                }
                "CASEMAPPING" => {
                    self.casemapping = match value {
                        "ascii" => CaseMapping::Ascii,
                        "strict-rfc1459" => CaseMapping::StrictRfc1459,
                        _ => CaseMapping::Rfc1459,
                    };
                }
                _ => {}
            }
        }
    }

    /// Advertised maximum nick length, if any.
    pub fn nicklen(&self) -> Option<usize> {
        self.nicklen
    }

    /// Power rank of a status prefix; 0 is the most powerful. `None` for
    /// characters that are not status prefixes on this server.
    fn prefix_rank(&self, prefix: char) -> Option<usize> {
        self.prefixes.iter().position(|&(_, p)| p == prefix)
    }

    /// Whether `prefix` outranks `than` in the server's PREFIX ordering.
    pub fn is_prefix_more_powerful_than(&self, prefix: char, than: char) -> bool {
        match (self.prefix_rank(prefix), self.prefix_rank(than)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    /// Operator-equivalence: `@` itself or anything more powerful.
    pub fn is_operator_prefix(&self, prefix: char) -> bool {
        prefix == '@' || self.is_prefix_more_powerful_than(prefix, '@')
    }

    /// The channel mode letter a status prefix corresponds to.
    pub fn mode_for_prefix(&self, prefix: char) -> Option<char> {
        self.prefixes
            .iter()
            .find(|&&(_, p)| p == prefix)
            .map(|&(m, _)| m)
    }

    /// Split the status prefixes off a NAMES entry.
    pub fn split_name(&self, name: &str) -> (String, String) {
        let nick: String = name
            .chars()
            .skip_while(|&c| self.prefix_rank(c).is_some())
            .collect();
        let prefixes: String = name.chars().take(name.len() - nick.len()).collect();
        (prefixes, nick)
    }

    /// Case-fold per the server's CASEMAPPING.
    pub fn to_lower(&self, s: &str) -> String {
        s.chars()
            .map(|c| match (c, self.casemapping) {
                ('[', CaseMapping::Rfc1459 | CaseMapping::StrictRfc1459) => '{',
                (']', CaseMapping::Rfc1459 | CaseMapping::StrictRfc1459) => '}',
                ('\\', CaseMapping::Rfc1459 | CaseMapping::StrictRfc1459) => '|',
                ('~', CaseMapping::Rfc1459) => '^',
                _ => c.to_ascii_lowercase(),
            })
            .collect()
    }
}

/// Parse `(qaohv)~&@%+` into ordered (mode, prefix) pairs.
fn parse_prefix(value: &str) -> Option<Vec<(char, char)>> {
    let rest = value.strip_prefix('(')?;
    let (modes, prefixes) = rest.split_once(')')?;
    if modes.chars().count() != prefixes.chars().count() {
        return None;
    }
    Some(modes.chars().zip(prefixes.chars()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreal_like() -> Isupport {
        let mut isupport = Isupport::default();
        isupport.apply_tokens(["PREFIX=(qaohv)~&@%+", "NICKLEN=30", "CASEMAPPING=ascii"]);
        isupport
    }

    #[test]
    fn parses_prefix_ordering() {
        let isupport = unreal_like();
        assert!(isupport.is_prefix_more_powerful_than('~', '@'));
        assert!(isupport.is_prefix_more_powerful_than('&', '%'));
        assert!(!isupport.is_prefix_more_powerful_than('+', '@'));
        assert!(!isupport.is_prefix_more_powerful_than('x', '@'));
    }

    #[test]
    fn operator_equivalence_includes_more_powerful_prefixes() {
        let isupport = unreal_like();
        assert!(isupport.is_operator_prefix('@'));
        assert!(isupport.is_operator_prefix('~'));
        assert!(isupport.is_operator_prefix('&'));
        assert!(!isupport.is_operator_prefix('%'));
        assert!(!isupport.is_operator_prefix('+'));
    }

    #[test]
    fn mode_for_prefix_follows_advertisement() {
        let isupport = unreal_like();
        assert_eq!(isupport.mode_for_prefix('~'), Some('q'));
        assert_eq!(isupport.mode_for_prefix('@'), Some('o'));
        assert_eq!(isupport.mode_for_prefix('+'), Some('v'));
        assert_eq!(isupport.mode_for_prefix('?'), None);
    }

    #[test]
    fn split_name_strips_stacked_prefixes() {
        let isupport = unreal_like();
        assert_eq!(
            isupport.split_name("~@alice"),
            ("~@".to_string(), "alice".to_string())
        );
        assert_eq!(isupport.split_name("bob"), (String::new(), "bob".to_string()));
    }

    #[test]
    fn nicklen_advertised() {
        assert_eq!(unreal_like().nicklen(), Some(30));
        assert_eq!(Isupport::default().nicklen(), None);
    }

    #[test]
    fn case_folds_per_mapping() {
        let rfc = Isupport::default();
        assert_eq!(rfc.to_lower("Nick[a]~X"), "nick{a}^x");
        let ascii = unreal_like();
        assert_eq!(ascii.to_lower("Nick[a]~X"), "nick[a]~x");
    }
}
