//! Which processes get instrumented

use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use anyhow::{bail, Context};
use regex::Regex;

use super::scanner::ProcessInfo;

/// Port list such as `80,443,8080-8089`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRanges(Vec<RangeInclusive<u16>>);

impl PortRanges {
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|r| r.contains(&port))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for PortRanges {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();

        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some((start, end)) = part.split_once('-') {
                // Range like "8080-8089"
                let invalid = || format!("Invalid port in '{part}'");
                let start: u16 = start.trim().parse().with_context(invalid)?;
                let end: u16 = end.trim().parse().with_context(invalid)?;
                if start > end {
                    bail!("Invalid port range '{part}': start is after end");
                }
                ranges.push(start..=end);
            } else {
                // Single port like "80"
                let port: u16 = part
                    .parse()
                    .with_context(|| format!("Invalid port '{part}'"))?;
                ranges.push(port..=port);
            }
        }

        Ok(Self(ranges))
    }
}

impl fmt::Display for PortRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|r| {
                if r.start() == r.end() {
                    r.start().to_string()
                } else {
                    format!("{}-{}", r.start(), r.end())
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

/// A process matches when every configured criterion matches
#[derive(Debug, Clone, Default)]
pub struct SelectionCriteria {
    /// Matched against the executable path and the command name
    pub exec: Option<Regex>,
    pub ports: PortRanges,
    pub pid_namespace: Option<u32>,
}

impl SelectionCriteria {
    /// True when nothing was configured; such criteria match nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exec.is_none() && self.ports.is_empty()
    }

    #[must_use]
    pub fn matches(&self, process: &ProcessInfo) -> bool {
        if self.is_empty() {
            return false;
        }

        if let Some(exec) = &self.exec {
            let exe = process.exe.to_string_lossy();
            if !exec.is_match(&exe) && !exec.is_match(&process.comm) {
                return false;
            }
        }

        if !self.ports.is_empty() && !process.ports.iter().any(|p| self.ports.contains(*p)) {
            return false;
        }

        self.pid_namespace.is_none_or(|ns| ns == process.pid_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Pid;
    use std::path::PathBuf;

    fn process(exe: &str, ports: &[u16], pid_ns: u32) -> ProcessInfo {
        ProcessInfo {
            pid: Pid(50),
            ns_pid: 50,
            pid_ns,
            comm: PathBuf::from(exe)
                .file_name()
                .unwrap()
                .to_string_lossy()
                .into_owned(),
            exe: PathBuf::from(exe),
            ports: ports.to_vec(),
        }
    }

    #[test]
    fn test_parse_port_ranges() {
        let ports: PortRanges = "80, 8080-8089,443".parse().unwrap();
        assert!(ports.contains(80));
        assert!(ports.contains(8085));
        assert!(ports.contains(443));
        assert!(!ports.contains(8090));
        assert_eq!(ports.to_string(), "80,8080-8089,443");
    }

    #[test]
    fn test_parse_port_ranges_rejects_garbage() {
        assert!("80-".parse::<PortRanges>().is_err());
        assert!("9000-8000".parse::<PortRanges>().is_err());
        assert!("70000".parse::<PortRanges>().is_err());
        assert!("".parse::<PortRanges>().unwrap().is_empty());
    }

    #[test]
    fn test_all_criteria_must_match() {
        let criteria = SelectionCriteria {
            exec: Some(Regex::new("nginx$").unwrap()),
            ports: "80".parse().unwrap(),
            pid_namespace: None,
        };
        assert!(criteria.matches(&process("/usr/sbin/nginx", &[80], 1)));
        assert!(!criteria.matches(&process("/usr/sbin/nginx", &[81], 1)));
        assert!(!criteria.matches(&process("/usr/bin/envoy", &[80], 1)));
    }

    #[test]
    fn test_namespace_filter() {
        let criteria = SelectionCriteria {
            exec: Some(Regex::new("app").unwrap()),
            ports: PortRanges::default(),
            pid_namespace: Some(7),
        };
        assert!(criteria.matches(&process("/srv/app", &[], 7)));
        assert!(!criteria.matches(&process("/srv/app", &[], 8)));
    }

    #[test]
    fn test_empty_criteria_match_nothing() {
        assert!(!SelectionCriteria::default().matches(&process("/srv/app", &[80], 1)));
    }
}
