//! Minimal reader for IOS-style running configurations.
//!
//! Top-level statements start in column zero; their sub-commands follow,
//! indented by at least one space. `!` lines are separators.

/// A parsed running configuration.
#[derive(Debug, Clone, Default)]
pub struct RunningConfig {
    lines: Vec<String>,
}

impl RunningConfig {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.trim().is_empty() && line.trim() != "!")
            .collect();
        Self { lines }
    }

    fn is_top_level(line: &str) -> bool {
        !line.starts_with(char::is_whitespace)
    }

    /// Top-level lines starting with `prefix`.
    pub fn find_lines(&self, prefix: &str) -> Vec<&str> {
        self.lines
            .iter()
            .map(String::as_str)
            .filter(|line| Self::is_top_level(line) && line.starts_with(prefix))
            .collect()
    }

    /// True when the exact top-level line is present.
    pub fn has_line(&self, line: &str) -> bool {
        self.lines
            .iter()
            .any(|l| Self::is_top_level(l) && l == line)
    }

    /// Trimmed sub-commands of the top-level line `parent`.
    pub fn find_children(&self, parent: &str) -> Vec<&str> {
        let Some(start) = self
            .lines
            .iter()
            .position(|l| Self::is_top_level(l) && l == parent)
        else {
            return Vec::new();
        };

        self.lines[start + 1..]
            .iter()
            .take_while(|l| !Self::is_top_level(l))
            .map(|l| l.trim())
            .collect()
    }

    /// Names of the configured VRFs.
    pub fn vrfs(&self) -> Vec<&str> {
        self.find_lines("ip vrf ")
            .into_iter()
            .filter_map(|line| line.strip_prefix("ip vrf "))
            .map(str::trim)
            .collect()
    }

    pub fn has_interface(&self, name: &str) -> bool {
        self.has_line(&format!("interface {}", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = "\
!
hostname csr-1
!
ip vrf nrouter-5c7f1d
!
ip vrf nrouter-0a1b2c
!
interface GigabitEthernet2
 no ip address
!
interface GigabitEthernet2.101
 encapsulation dot1Q 101
 ip vrf forwarding nrouter-5c7f1d
 ip address 10.0.0.1 255.255.255.0
 ip nat inside
!
ip access-list standard acl_101
 permit 10.0.0.0 0.0.0.255
!
ip nat inside source list acl_101 interface GigabitEthernet3.100 vrf nrouter-5c7f1d overload
ip route vrf nrouter-5c7f1d 0.0.0.0 0.0.0.0 172.16.0.1
end
";

    #[test]
    fn test_vrfs() {
        let config = RunningConfig::parse(CONFIG);
        assert_eq!(config.vrfs(), vec!["nrouter-5c7f1d", "nrouter-0a1b2c"]);
    }

    #[test]
    fn test_children() {
        let config = RunningConfig::parse(CONFIG);

        assert_eq!(
            config.find_children("ip access-list standard acl_101"),
            vec!["permit 10.0.0.0 0.0.0.255"]
        );
        assert!(config
            .find_children("interface GigabitEthernet2.101")
            .contains(&"ip nat inside"));
        assert!(config.find_children("interface GigabitEthernet9").is_empty());
    }

    #[test]
    fn test_exact_lines() {
        let config = RunningConfig::parse(CONFIG);

        assert!(config.has_interface("GigabitEthernet2.101"));
        assert!(!config.has_interface("GigabitEthernet2.10"));
        assert!(config.has_line("ip route vrf nrouter-5c7f1d 0.0.0.0 0.0.0.0 172.16.0.1"));
        // Sub-commands are not top-level lines.
        assert!(!config.has_line("ip nat inside"));
    }

    #[test]
    fn test_find_lines_prefix() {
        let config = RunningConfig::parse(CONFIG);
        assert_eq!(config.find_lines("ip nat inside source list").len(), 1);
        assert_eq!(config.find_lines("ip route vrf nrouter-0a1b2c").len(), 0);
    }
}
