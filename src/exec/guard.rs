//! Denylist screen for worker-requested commands.
//!
//! This is a tripwire for obviously destructive requests, not a security
//! boundary: commands still run with the engine's own privileges. Matching
//! is substring/pattern based and deliberately over-blocks.

use std::sync::OnceLock;

use regex::RegexSet;

/// Why a command was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVeto {
    Empty,
    TooLong { len: usize, max: usize },
    MultiLine,
    Destructive { fragment: String },
}

impl std::fmt::Display for CommandVeto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandVeto::Empty => write!(f, "command is empty"),
            CommandVeto::TooLong { len, max } => {
                write!(f, "command is {} chars, limit is {}", len, max)
            }
            CommandVeto::MultiLine => write!(f, "command must be a single line"),
            CommandVeto::Destructive { fragment } => {
                write!(f, "command matches denylisted fragment '{}'", fragment)
            }
        }
    }
}

/// Longest accepted command, in characters.
pub const MAX_COMMAND_CHARS: usize = 2000;

// Substring fragments. Checked against the lowercased command.
const DESTRUCTIVE_FRAGMENTS: &[&str] = &[
    // filesystem wipes
    "rm -rf /",
    "rm -fr /",
    "rm -rf ~",
    "rm -rf *",
    "mkfs",
    "dd if=/dev/zero",
    "> /dev/sd",
    // machine state
    "shutdown",
    "reboot",
    "poweroff",
    "init 0",
    "init 6",
    // service control
    "systemctl stop",
    "systemctl disable",
    "systemctl poweroff",
    // fork bombs
    ":(){",
    ":|:&",
];

// Patterns for shapes a substring cannot express.
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    r"\bservice\s+\S+\s+stop\b",
    r"\bkill\s+-9\s+-?1\b",
    r":\s*\(\s*\)\s*\{",
];

fn destructive_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RegexSet::new(DESTRUCTIVE_PATTERNS).expect("Invalid denylist pattern")
    })
}

/// Screen a command before it may reach the process runner.
pub fn screen_command(command: &str) -> Result<(), CommandVeto> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(CommandVeto::Empty);
    }

    let len = trimmed.chars().count();
    if len > MAX_COMMAND_CHARS {
        return Err(CommandVeto::TooLong {
            len,
            max: MAX_COMMAND_CHARS,
        });
    }

    if trimmed.contains('\n') || trimmed.contains('\r') {
        return Err(CommandVeto::MultiLine);
    }

    let lower = trimmed.to_lowercase();
    for fragment in DESTRUCTIVE_FRAGMENTS {
        if lower.contains(fragment) {
            return Err(CommandVeto::Destructive {
                fragment: fragment.to_string(),
            });
        }
    }
    if let Some(idx) = destructive_patterns().matches(&lower).iter().next() {
        return Err(CommandVeto::Destructive {
            fragment: DESTRUCTIVE_PATTERNS[idx].to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinary_commands_pass() {
        assert!(screen_command("ls -la").is_ok());
        assert!(screen_command("python3 collect.py --pages 3 && cat report.md").is_ok());
        assert!(screen_command("rm -rf build/").is_ok());
    }

    #[test]
    fn test_over_blocking_is_accepted() {
        // Fragment matching has false positives; a worker mentioning
        // "shutdown" in any argument is refused and must rephrase.
        assert!(screen_command("grep -r shutdown_hook src/").is_err());
    }

    #[test]
    fn test_filesystem_wipes_rejected() {
        assert!(matches!(
            screen_command("rm -rf / --no-preserve-root"),
            Err(CommandVeto::Destructive { .. })
        ));
        assert!(matches!(
            screen_command("mkfs.ext4 /dev/sda1"),
            Err(CommandVeto::Destructive { .. })
        ));
        assert!(matches!(
            screen_command("dd if=/dev/zero of=/dev/sda"),
            Err(CommandVeto::Destructive { .. })
        ));
    }

    #[test]
    fn test_machine_state_rejected() {
        assert!(screen_command("sudo shutdown -h now").is_err());
        assert!(screen_command("reboot").is_err());
        assert!(screen_command("systemctl stop nginx").is_err());
        assert!(screen_command("service nginx stop").is_err());
    }

    #[test]
    fn test_fork_bomb_rejected() {
        assert!(matches!(
            screen_command(":(){ :|:& };:"),
            Err(CommandVeto::Destructive { .. })
        ));
        assert!(screen_command(": ( ) { : | : & } ; :").is_err());
    }

    #[test]
    fn test_sanity_checks() {
        assert_eq!(screen_command("   "), Err(CommandVeto::Empty));
        assert_eq!(
            screen_command("echo a\necho b"),
            Err(CommandVeto::MultiLine)
        );
        let long = "x".repeat(MAX_COMMAND_CHARS + 1);
        assert!(matches!(
            screen_command(&long),
            Err(CommandVeto::TooLong { .. })
        ));
    }

    #[test]
    fn test_veto_messages_are_descriptive() {
        let veto = screen_command("reboot").unwrap_err();
        assert!(veto.to_string().contains("reboot"));
    }
}
