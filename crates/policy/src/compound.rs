//! Control-operator detection for shell command text.

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
    /// Bash ANSI-C quoting, `$'...'`: backslash escapes apply, so `\'` does
    /// not close it.
    AnsiC,
}

/// Returns the first shell control operator found outside quotes, if any.
///
/// Recognised: `;`, `&`/`&&`, `|`/`||`, newlines, backticks, `$(` and the
/// process substitutions `<(` and `>(`.  Command substitution counts inside
/// double quotes because the shell still expands it there.  Redirections
/// such as `2>&1`, `&>` and `>|` are not control operators.
pub fn find_control_operator(command: &str) -> Option<&'static str> {
    let chars: Vec<char> = command.chars().collect();
    let mut quote = Quote::None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let prev = i.checked_sub(1).map(|p| chars[p]);
        let next = chars.get(i + 1).copied();

        match quote {
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                }
                i += 1;
                continue;
            }
            Quote::AnsiC => {
                match c {
                    '\\' => i += 1,
                    '\'' => quote = Quote::None,
                    _ => {}
                }
                i += 1;
                continue;
            }
            Quote::Double | Quote::None => {}
        }

        match c {
            '\\' => {
                // Skip the escaped character; a trailing backslash is inert.
                i += 2;
                continue;
            }
            '`' => return Some("`"),
            '$' if next == Some('(') => return Some("$("),
            '"' => {
                quote = if quote == Quote::Double {
                    Quote::None
                } else {
                    Quote::Double
                };
            }
            _ if quote == Quote::Double => {}
            '$' if next == Some('\'') => {
                quote = Quote::AnsiC;
                i += 2;
                continue;
            }
            '\'' => quote = Quote::Single,
            '<' if next == Some('(') => return Some("<("),
            '>' if next == Some('(') => return Some(">("),
            ';' => return Some(";"),
            '\n' | '\r' => return Some("newline"),
            '&' => {
                let redirect = matches!(prev, Some('>') | Some('<')) || next == Some('>');
                if !redirect {
                    return Some(if next == Some('&') { "&&" } else { "&" });
                }
            }
            '|' => {
                if prev != Some('>') {
                    return Some(if next == Some('|') { "||" } else { "|" });
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_commands_have_no_operator() {
        assert_eq!(find_control_operator("systemctl status nginx"), None);
        assert_eq!(find_control_operator("ls -la /var/log"), None);
    }

    #[test]
    fn reports_each_operator() {
        assert_eq!(find_control_operator("a; b"), Some(";"));
        assert_eq!(find_control_operator("a && b"), Some("&&"));
        assert_eq!(find_control_operator("a || b"), Some("||"));
        assert_eq!(find_control_operator("a | b"), Some("|"));
        assert_eq!(find_control_operator("a &"), Some("&"));
        assert_eq!(find_control_operator("a\nb"), Some("newline"));
        assert_eq!(find_control_operator("echo $(id)"), Some("$("));
        assert_eq!(find_control_operator("echo `id`"), Some("`"));
    }

    #[test]
    fn quotes_hide_operators() {
        assert_eq!(find_control_operator("echo 'a;b|c&&d'"), None);
        assert_eq!(find_control_operator("echo \"a;b|c\""), None);
        // Substitution still expands inside double quotes.
        assert_eq!(find_control_operator("echo \"$(id)\""), Some("$("));
        assert_eq!(find_control_operator("echo '$(id)'"), None);
    }

    #[test]
    fn unterminated_quote_swallows_the_rest() {
        assert_eq!(find_control_operator("echo 'a; b"), None);
    }

    #[test]
    fn escapes_and_redirections_are_ignored() {
        assert_eq!(find_control_operator(r"echo a\;b"), None);
        assert_eq!(find_control_operator("cmd 2>&1"), None);
        assert_eq!(find_control_operator("cmd &> /dev/null"), None);
        assert_eq!(find_control_operator("cmd >| out.txt"), None);
        assert_eq!(find_control_operator(r"echo \"), None);
    }

    #[test]
    fn ansi_c_quotes_honor_escaped_quotes() {
        assert_eq!(find_control_operator(r"echo $'a\'b'; reboot"), Some(";"));
        assert_eq!(find_control_operator(r"echo $'a;b\n'"), None);
        assert_eq!(find_control_operator(r"echo $'\\'| sh"), Some("|"));
        // Inside double quotes `$'` is literal text.
        assert_eq!(find_control_operator("echo \"$'\" ; id"), Some(";"));
    }

    #[test]
    fn process_substitution_is_reported() {
        assert_eq!(find_control_operator("cat <(reboot)"), Some("<("));
        assert_eq!(find_control_operator("tee >(sh) < /dev/null"), Some(">("));
        assert_eq!(find_control_operator("echo '<(x)'"), None);
        assert_eq!(find_control_operator("sort < input.txt > out.txt"), None);
    }

    #[test]
    fn operator_after_quoted_section_is_found() {
        assert_eq!(find_control_operator("echo 'x' ; reboot"), Some(";"));
        assert_eq!(find_control_operator("echo \"x\" | sh"), Some("|"));
    }
}
