//! Restricted-mode command vetting.
//!
//! A compile-time table of regex rules vetoes destructive commands before
//! they reach a session. A command is first split into pipeline/sequence
//! segments at unquoted `|`, `;`, `&&`, `||` and newlines; each segment is
//! then matched against anchored patterns, so a dangerous word inside a
//! quoted argument never matches:
//!
//! - `rm file.txt` — blocked (segment starts with `rm`)
//! - `echo foo | sudo tee x` — blocked (second segment starts with `sudo`)
//! - `grep 'rm' script.sh` — allowed (`rm` is a quoted argument)
//!
//! # Known limitations
//!
//! Commands inside subshells (`bash -c 'sudo …'`, `$(…)`) and commands
//! fed through `xargs` are not caught. The checker is a guard rail for an
//! agent's direct mistakes, not a sandbox.

use once_cell::sync::Lazy;
use regex::Regex;

/// Why a rule exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCategory {
    DestructiveFile,
    SystemModification,
    PrivilegeEscalation,
}

impl RuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleCategory::DestructiveFile => "destructive-file",
            RuleCategory::SystemModification => "system-modification",
            RuleCategory::PrivilegeEscalation => "privilege-escalation",
        }
    }
}

/// One veto rule.
#[derive(Debug)]
pub struct Rule {
    pub category: RuleCategory,
    pub description: &'static str,
    pattern: Regex,
}

static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    let rule = |category, description, pattern: &str| Rule {
        category,
        description,
        pattern: Regex::new(pattern).expect("valid built-in pattern"),
    };
    vec![
        rule(
            RuleCategory::PrivilegeEscalation,
            "privilege escalation",
            r"^(?:sudo|su|doas|pkexec)(?:\s|$)",
        ),
        rule(
            RuleCategory::DestructiveFile,
            "file deletion or destruction",
            r"^(?:rm|rmdir|shred|wipe|srm|unlink|dd)(?:\s|$)",
        ),
        rule(
            RuleCategory::DestructiveFile,
            "file truncation",
            r"^truncate\s+-s\s+0(?:\s|$)",
        ),
        rule(
            RuleCategory::DestructiveFile,
            "redirect truncation",
            r"^>\s*\S+",
        ),
        rule(
            RuleCategory::SystemModification,
            "system modification",
            r"^(?:chmod|chown|chgrp|chattr|fdisk|parted|mount|umount|fsck|mkfs(?:\.[A-Za-z0-9]+)?|shutdown|reboot|poweroff|halt|init|useradd|userdel|usermod|groupadd|groupdel|groupmod|passwd|systemctl|service|insmod|rmmod|modprobe|setenforce|aa-enforce|aa-complain)(?:\s|$)",
        ),
    ]
});

/// Split a command line into segments at unquoted separators.
///
/// Separators are `|`, `||`, `;`, `&&` and newlines. Single and double
/// quotes protect their contents; backslash escapes the next character
/// outside single quotes.
fn split_segments(cmd: &str) -> Vec<&str> {
    let bytes = cmd.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\\' if !in_single => {
                i += 2;
                continue;
            }
            b'\'' if !in_double => in_single = !in_single,
            b'"' if !in_single => in_double = !in_double,
            b'|' | b';' | b'\n' if !in_single && !in_double => {
                segments.push(&cmd[start..i]);
                // Swallow the second half of `||`.
                if b == b'|' && bytes.get(i + 1) == Some(&b'|') {
                    i += 1;
                }
                start = i + 1;
            }
            b'&' if !in_single && !in_double && bytes.get(i + 1) == Some(&b'&') => {
                segments.push(&cmd[start..i]);
                i += 1;
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    segments.push(&cmd[start..]);
    segments
}

/// Pattern-based veto of destructive commands.
///
/// The verdict is a pure function of `(enabled, cmd)`; a disabled checker
/// never matches.
#[derive(Debug, Clone, Copy)]
pub struct RestrictionChecker {
    enabled: bool,
}

impl RestrictionChecker {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The first rule matching any segment of `cmd`, or `None`.
    pub fn check(&self, cmd: &str) -> Option<&'static Rule> {
        if !self.enabled {
            return None;
        }
        for segment in split_segments(cmd) {
            let segment = segment.trim_start();
            for rule in RULES.iter() {
                if rule.pattern.is_match(segment) {
                    return Some(rule);
                }
            }
        }
        None
    }
}
