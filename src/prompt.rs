//! Prompt rendering.
//!
//! Pure functions from `(session name, cwd)` to the prompt string the
//! interactive shell prints. The colored variant styles the session name
//! (green for `local`, cyan for remotes) and the cwd (blue); the plain
//! variant carries no escape codes, for dumb terminals and tests.

use std::path::Path;

use crossterm::style::Stylize;

/// Shorten a cwd for display: the home directory collapses to `~`, and
/// paths deeper than four components keep only the last three.
pub fn shorten_cwd(cwd: &str) -> String {
    let display = match dirs::home_dir() {
        Some(home) if Path::new(cwd) == home => "~".to_string(),
        Some(home) => match Path::new(cwd).strip_prefix(&home) {
            Ok(rest) => format!("~/{}", rest.display()),
            Err(_) => cwd.to_string(),
        },
        None => cwd.to_string(),
    };

    let components: Vec<&str> = display.split('/').filter(|c| !c.is_empty()).collect();
    if components.len() > 4 {
        let tail = &components[components.len() - 3..];
        format!(".../{}", tail.join("/"))
    } else {
        display
    }
}

/// Colored prompt: `(name) cwd $ `.
pub fn format_prompt(name: &str, cwd: &str) -> String {
    let short = shorten_cwd(cwd);
    let styled_name = if name == "local" {
        name.green().to_string()
    } else {
        name.cyan().to_string()
    };
    format!("({}) {} $ ", styled_name, short.as_str().blue())
}

/// Plain prompt with no escape codes.
pub fn format_prompt_plain(name: &str, cwd: &str) -> String {
    format!("({}) {} $ ", name, shorten_cwd(cwd))
}

#[cfg(test)]
mod tests {
    use super::*;

    mod shortening {
        use super::*;

        #[test]
        fn test_home_collapses_to_tilde() {
            let home = dirs::home_dir().unwrap();
            assert_eq!(shorten_cwd(home.to_str().unwrap()), "~");
        }

        #[test]
        fn test_path_under_home_keeps_tilde_prefix() {
            let home = dirs::home_dir().unwrap();
            let cwd = home.join("src");
            assert_eq!(shorten_cwd(cwd.to_str().unwrap()), "~/src");
        }

        #[test]
        fn test_short_path_unchanged() {
            assert_eq!(shorten_cwd("/var/log"), "/var/log");
            assert_eq!(shorten_cwd("/a/b/c/d"), "/a/b/c/d");
        }

        #[test]
        fn test_deep_path_keeps_last_three() {
            assert_eq!(shorten_cwd("/a/b/c/d/e"), ".../c/d/e");
            assert_eq!(shorten_cwd("/one/two/three/four/five/six"), ".../four/five/six");
        }

        #[test]
        fn test_root_is_unchanged() {
            assert_eq!(shorten_cwd("/"), "/");
        }
    }

    mod formatting {
        use super::*;

        #[test]
        fn test_plain_prompt_shape() {
            assert_eq!(format_prompt_plain("local", "/var/log"), "(local) /var/log $ ");
        }

        #[test]
        fn test_plain_prompt_has_no_escapes() {
            let prompt = format_prompt_plain("web", "/srv");
            assert!(!prompt.contains('\u{1b}'));
        }

        #[test]
        fn test_colored_prompt_contains_escapes_and_name() {
            let prompt = format_prompt("web", "/srv");
            assert!(prompt.contains('\u{1b}'));
            assert!(prompt.contains("web"));
            assert!(prompt.contains("/srv"));
            assert!(prompt.ends_with("$ "));
        }

        #[test]
        fn test_local_and_remote_are_styled_differently() {
            let local = format_prompt("local", "/srv");
            let remote = format_prompt("web", "/srv");
            // Same cwd, different name colors.
            assert_ne!(
                local.replace("local", "X"),
                remote.replace("web", "X")
            );
        }
    }
}
