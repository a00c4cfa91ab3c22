use crate::drivers::{Settings, SubmissionError};
use tracing::{debug, warn};

/// How a single scheduler flag is filled in from the job settings
#[derive(Debug, Clone, Copy)]
pub struct FlagSpec {
    /// settings key
    pub key: &'static str,
    /// rendered flag, e.g. `--driver-cores`
    pub flag: &'static str,
    /// value rendered when the key is absent, the flag is skipped without one
    pub default: Option<&'static str>,
    /// whether an absent key is worth a warning
    pub warn_if_absent: bool,
}

impl FlagSpec {
    pub const fn with_default(key: &'static str, flag: &'static str, default: &'static str) -> Self {
        Self {
            key,
            flag,
            default: Some(default),
            warn_if_absent: false,
        }
    }

    pub const fn optional(key: &'static str, flag: &'static str) -> Self {
        Self {
            key,
            flag,
            default: None,
            warn_if_absent: true,
        }
    }
}

/// Render `specs` in order as `flag value` words
///
/// Defaults land in the same position an explicit value would. Missing keys
/// flagged with `warn_if_absent` add a message to `warnings`.
pub fn render_flags(
    settings: &Settings,
    specs: &[FlagSpec],
    warnings: &mut Vec<String>,
) -> Result<Vec<String>, SubmissionError> {
    let mut words = Vec::with_capacity(specs.len() * 2);

    for spec in specs {
        let value = match settings.scalar(spec.key)? {
            Some(value) => value,
            None => {
                if spec.warn_if_absent {
                    let message = format!("'{}' is not set, {} is omitted", spec.key, spec.flag);
                    warn!("{message}");
                    warnings.push(message);
                }

                match spec.default {
                    Some(default) => {
                        debug!(key = spec.key, default = default, "Using default");
                        default.to_string()
                    }
                    None => continue,
                }
            }
        };

        words.push(spec.flag.to_string());
        words.push(shell_quote(&value));
    }

    Ok(words)
}

/// quote `word` for a POSIX shell, words made of safe characters are left alone
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | ',' | '@' | '%' | '+')
        });

    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// escape `text` so it matches itself as an extended regular expression
pub fn pattern_escape(text: &str) -> String {
    text.chars().fold(String::with_capacity(text.len()), |mut escaped, c| {
        if matches!(
            c,
            '\\' | '.' | '^' | '$' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']' | '{' | '}'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
        escaped
    })
}
