//! U-Boot console dialects spoken by Yún-family boards.
//!
//! Three bootloader generations are in the field, each announcing autoboot
//! with a different banner:
//!
//! | banner fragment                           | stop sequence  |
//! |-------------------------------------------|----------------|
//! | `stop with '<keyword>'`                   | the keyword    |
//! | `Hit any key to stop autoboot`            | a bare newline |
//! | `type '<keyword>' to enter u-boot console`| the keyword    |
//!
//! Once autoboot is stopped the bootloader shows a `name>` prompt. The shell
//! name doubles as a version marker: anything other than [`FIXED_SHELL`]
//! is a pre-production bootloader that has to be replaced before the system
//! image goes on.

use crate::Result;
use crate::console::{ExpectMatch, ExpectPattern};

/// Shell prompt name of the current Arduino U-Boot build.
pub const FIXED_SHELL: &str = "arduino";

/// Stop keyword understood by the current Arduino U-Boot build.
pub const FIXED_STOP: &str = "ard";

/// RAM address images are fetched to before being copied into flash.
pub const LOAD_ADDR: &str = "0x80060000";

/// Flash base of the bootloader itself.
pub const BOOTLOADER_BASE: &str = "0x9f000000";

/// Erase length covering the bootloader region.
pub const BOOTLOADER_ERASE_LEN: &str = "+0x40000";

/// Flash base of the U-Boot environment sector.
pub const ENV_BASE: &str = "0x9f040000";

/// Erase length covering the environment sector.
pub const ENV_ERASE_LEN: &str = "+0x10000";

/// Flash base of the system image.
pub const FIRMWARE_BASE: &str = "0x9f050000";

/// Autoboot banners of all known bootloader generations, in the order they
/// should be tried.
pub fn banner_patterns() -> Result<Vec<ExpectPattern>> {
    Ok(vec![
        ExpectPattern::new("stop-keyword", r"stop with '(?P<keyword>[a-z]+)'")?,
        ExpectPattern::new("any-key", "Hit any key to stop autoboot")?,
        ExpectPattern::new(
            "console-keyword",
            r"type '(?P<keyword>[a-z]+)' to enter u-boot console",
        )?,
    ])
}

/// The stop sequence implied by a banner match, without the trailing
/// newline. Empty means the bootloader stops on any key.
#[must_use]
pub fn stop_keyword(banner: &ExpectMatch) -> String {
    banner.group("keyword").unwrap_or_default().to_string()
}

/// Matches any `name>` prompt and captures the shell name.
pub fn generic_prompt() -> Result<ExpectPattern> {
    ExpectPattern::new("prompt", r"(?P<shell>[0-9a-zA-Z]+)>")
}

/// Matches the prompt of one specific shell.
pub fn shell_prompt(shell: &str) -> Result<ExpectPattern> {
    ExpectPattern::literal("prompt", &format!("{shell}>"))
}

/// Prompt of the current Arduino U-Boot build.
pub fn fixed_prompt() -> Result<ExpectPattern> {
    shell_prompt(FIXED_SHELL)
}

/// Matches `var=value` in printenv output and captures the value.
pub fn env_value(var: &'static str) -> Result<ExpectPattern> {
    ExpectPattern::new(var, &format!(r"{var}=(?P<value>\S+)"))
}

/// Matches the transfer summary printed after a tftp fetch and captures the
/// byte count.
pub fn bytes_transferred() -> Result<ExpectPattern> {
    ExpectPattern::new("bytes-transferred", r"Bytes transferred = (?P<bytes>[0-9]+)")
}

/// Matches the completion message of a flash erase.
pub fn erased_sectors() -> Result<ExpectPattern> {
    ExpectPattern::new("erased-sectors", r"Erased [0-9]+ sectors")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::find_match;

    fn banner_match(output: &str) -> ExpectMatch {
        let patterns = banner_patterns().unwrap();
        let (_, matched) = find_match(output, &patterns).unwrap();
        matched
    }

    #[test]
    fn keyword_banner_yields_its_keyword() {
        let matched = banner_match("Autobooting in 1 seconds, stop with 'ard'\r\n");
        assert_eq!(matched.pattern(), "stop-keyword");
        assert_eq!(stop_keyword(&matched), "ard");
    }

    #[test]
    fn any_key_banner_yields_empty_keyword() {
        let matched = banner_match("Hit any key to stop autoboot:  4\r\n");
        assert_eq!(matched.pattern(), "any-key");
        assert_eq!(stop_keyword(&matched), "");
    }

    #[test]
    fn console_banner_yields_its_keyword() {
        let matched = banner_match("Press Enter, type 'cen' to enter u-boot console\r\n");
        assert_eq!(matched.pattern(), "console-keyword");
        assert_eq!(stop_keyword(&matched), "cen");
    }

    #[test]
    fn generic_prompt_captures_shell_name() {
        let pattern = generic_prompt().unwrap();
        let (_, matched) = find_match("U-Boot 1.1.4\r\nlinino> ", &[pattern]).unwrap();
        assert_eq!(matched.group("shell"), Some("linino"));
    }

    #[test]
    fn shell_prompt_matches_only_its_shell() {
        let pattern = shell_prompt("arduino").unwrap();
        assert!(find_match("linino> ", std::slice::from_ref(&pattern)).is_none());
        assert!(find_match("arduino> ", &[pattern]).is_some());
    }

    #[test]
    fn env_value_captures_assignment() {
        let pattern = env_value("serverip").unwrap();
        let dump = "bootcmd=bootm 0x9f050000\r\nserverip=192.168.1.10\r\n";
        let (_, matched) = find_match(dump, &[pattern]).unwrap();
        assert_eq!(matched.group("value"), Some("192.168.1.10"));
    }

    #[test]
    fn bytes_transferred_captures_count() {
        let pattern = bytes_transferred().unwrap();
        let (_, matched) =
            find_match("Bytes transferred = 15663389 (ef041d hex)\r\n", &[pattern]).unwrap();
        assert_eq!(matched.group("bytes"), Some("15663389"));
    }
}
