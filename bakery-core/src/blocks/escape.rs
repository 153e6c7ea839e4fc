//! Quoting of block arguments for the generated bash scripts.

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_/-.,?:@#%^+=[]".contains(c)
}

fn is_safeish(c: char) -> bool {
    is_safe(c) || "{}|&()<>; *'".contains(c)
}

/// Quote `arg` so bash passes it through as a single word.
///
/// Plain words are left alone, words with only mildly special characters are
/// double quoted, and everything else is single quoted with embedded quotes
/// spliced in.
pub fn shell_escape(arg: &str) -> String {
    if arg.chars().all(is_safe) {
        return arg.to_string();
    }
    if arg.chars().all(is_safeish) {
        return format!("\"{arg}\"");
    }

    let mut out = String::with_capacity(arg.len() + 2);
    out.push('\'');
    let mut rest = arg;
    while !rest.is_empty() {
        let plain = rest.find('\'').unwrap_or(rest.len());
        out.push_str(&rest[..plain]);
        rest = &rest[plain..];

        let run = rest.len() - rest.trim_start_matches('\'').len();
        if run == 0 {
            continue;
        }
        if run < 3 {
            out.push('\'');
            out.push_str(&"\\'".repeat(run));
            out.push('\'');
        } else {
            out.push_str("'\"");
            out.push_str(&rest[..run]);
            out.push_str("\"'");
        }
        rest = &rest[run..];
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_pass_through() {
        assert_eq!(shell_escape("raspberrypi"), "raspberrypi");
        assert_eq!(shell_escape("/home/pi/file.txt"), "/home/pi/file.txt");
        assert_eq!(shell_escape(""), "");
    }

    #[test]
    fn spaces_get_double_quotes() {
        assert_eq!(shell_escape("My Network"), "\"My Network\"");
        assert_eq!(shell_escape("it's"), "\"it's\"");
    }

    #[test]
    fn dangerous_strings_get_single_quotes() {
        assert_eq!(shell_escape("$HOME"), "'$HOME'");
        assert_eq!(shell_escape("a\"b"), "'a\"b'");
    }

    #[test]
    fn quote_runs_inside_single_quotes() {
        assert_eq!(shell_escape("$it's"), "'$it'\\''s'");
        assert_eq!(shell_escape("$a''b"), "'$a'\\'\\''b'");
        assert_eq!(shell_escape("$a'''b"), "'$a'\"'''\"'b'");
    }
}
