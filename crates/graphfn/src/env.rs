use std::env;
use std::sync::OnceLock;

static GRAPHFN_DUMP_FUNCTIONS: OnceLock<bool> = OnceLock::new();
static GRAPHFN_VERIFY_PAYLOADS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn flag(cell: &OnceLock<bool>, name: &str) -> bool {
    *cell.get_or_init(|| match env::var(name) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Logs the text form of every registered function at debug level.
pub(crate) fn dump_functions_enabled() -> bool {
    flag(&GRAPHFN_DUMP_FUNCTIONS, "GRAPHFN_DUMP_FUNCTIONS")
}

/// Decodes each serialized payload and compares it with the lowered function before insertion.
pub(crate) fn verify_payloads_enabled() -> bool {
    flag(&GRAPHFN_VERIFY_PAYLOADS, "GRAPHFN_VERIFY_PAYLOADS")
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parses_common_truthy_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "off", "nope", ""] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
