//! Per-OS choice of shell binary and its command-string flag.

use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInvocation {
    /// Interpreter binary, e.g. `/bin/bash` or `cmd.exe`.
    pub program: String,
    /// Flag that makes the interpreter execute a command string.
    pub flag: &'static str,
}

/// Resolve the shell used to execute command strings on this host.
///
/// Unix: the user's `$SHELL` when it names an existing bash or zsh binary,
/// otherwise `/bin/bash`. Windows: `%ComSpec%`, defaulting to `cmd.exe`.
pub fn resolve_shell() -> ShellInvocation {
    #[cfg(unix)]
    {
        if let Ok(shell_path) = std::env::var("SHELL")
            && is_supported_unix_shell(&shell_path)
            && Path::new(&shell_path).exists()
        {
            return ShellInvocation {
                program: shell_path,
                flag: "-c",
            };
        }
        ShellInvocation {
            program: "/bin/bash".to_string(),
            flag: "-c",
        }
    }

    #[cfg(windows)]
    {
        let program = std::env::var("ComSpec").unwrap_or_else(|_| "cmd.exe".to_string());
        ShellInvocation {
            program,
            flag: "/C",
        }
    }
}

#[cfg(unix)]
fn is_supported_unix_shell(shell_path: &str) -> bool {
    matches!(
        Path::new(shell_path).file_name().and_then(|n| n.to_str()),
        Some("bash" | "zsh")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[cfg(unix)]
    #[test]
    fn resolves_a_command_string_shell() {
        let shell = resolve_shell();
        assert_eq!(shell.flag, "-c");
        assert!(Path::new(&shell.program).exists());
    }

    #[cfg(unix)]
    #[test]
    fn recognizes_only_bash_and_zsh() {
        assert!(is_supported_unix_shell("/usr/bin/zsh"));
        assert!(is_supported_unix_shell("/bin/bash"));
        assert!(!is_supported_unix_shell("/bin/sh"));
        assert!(!is_supported_unix_shell("/usr/bin/fish"));
    }
}
