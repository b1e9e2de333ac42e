//! Per-path policy and name patterns

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfError;

/// Source of a path that expects a wire publisher.
pub const SOURCE_PUBLISHER: &str = "publisher";

/// Policy attached to a path name or pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct PathConf {
    /// `"publisher"` or the URL of a static source pulled by an external
    /// connector.
    pub source: String,
    /// Start the static source only while readers are present.
    pub source_on_demand: bool,
    /// A second publisher displaces the current one instead of failing.
    pub override_publisher: bool,
    /// Where readers are redirected while nothing is publishing: a URL or
    /// another path name. Empty disables the redirect.
    pub fallback: String,

    pub publish_user: String,
    pub publish_pass: String,
    pub publish_ips: Vec<String>,
    pub read_user: String,
    pub read_pass: String,
    pub read_ips: Vec<String>,

    /// Seconds the path may sit without publisher and readers before being
    /// torn down. Static-source paths never idle out.
    pub idle_timeout: f64,

    pub run_on_init: String,
    pub run_on_init_restart: bool,
    pub run_on_demand: String,
    pub run_on_demand_restart: bool,
    /// Seconds a pending reader waits for the on-demand source.
    pub run_on_demand_start_timeout: f64,
    /// Linger seconds after the last reader before the source is stopped.
    pub run_on_demand_close_after: f64,
    pub run_on_ready: String,
    pub run_on_ready_restart: bool,
    pub run_on_publish: String,
    pub run_on_publish_restart: bool,
    pub run_on_read: String,
    pub run_on_read_restart: bool,
}

impl Default for PathConf {
    fn default() -> Self {
        Self {
            source: SOURCE_PUBLISHER.into(),
            source_on_demand: false,
            override_publisher: false,
            fallback: String::new(),
            publish_user: String::new(),
            publish_pass: String::new(),
            publish_ips: Vec::new(),
            read_user: String::new(),
            read_pass: String::new(),
            read_ips: Vec::new(),
            idle_timeout: 10.0,
            run_on_init: String::new(),
            run_on_init_restart: false,
            run_on_demand: String::new(),
            run_on_demand_restart: false,
            run_on_demand_start_timeout: 10.0,
            run_on_demand_close_after: 10.0,
            run_on_ready: String::new(),
            run_on_ready_restart: false,
            run_on_publish: String::new(),
            run_on_publish_restart: false,
            run_on_read: String::new(),
            run_on_read_restart: false,
        }
    }
}

impl PathConf {
    pub fn is_static_source(&self) -> bool {
        self.source != SOURCE_PUBLISHER
    }

    /// Whether a first reader can cause a source to be started.
    pub fn has_on_demand_source(&self) -> bool {
        !self.run_on_demand.is_empty() || (self.is_static_source() && self.source_on_demand)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.idle_timeout)
    }

    pub fn on_demand_start_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.run_on_demand_start_timeout)
    }

    pub fn on_demand_close_after(&self) -> Duration {
        Duration::from_secs_f64(self.run_on_demand_close_after)
    }

    pub fn check(&self, name: &str) -> Result<(), ConfError> {
        let err = |msg: String| Err(ConfError::InvalidPath(name.to_string(), msg));

        if self.source != SOURCE_PUBLISHER && !self.source.contains("://") {
            return err(format!("invalid source '{}'", self.source));
        }
        if self.source_on_demand && !self.is_static_source() {
            return err("sourceOnDemand requires a URL source".into());
        }
        if !self.run_on_demand.is_empty() && self.is_static_source() {
            return err("runOnDemand requires source 'publisher'".into());
        }
        if !self.fallback.is_empty()
            && !self.fallback.contains("://")
            && super::valid_path_name(&self.fallback).is_err()
        {
            return err(format!("invalid fallback '{}'", self.fallback));
        }
        for (user, pass, what) in [
            (&self.publish_user, &self.publish_pass, "publish"),
            (&self.read_user, &self.read_pass, "read"),
        ] {
            if user.is_empty() != pass.is_empty() {
                return err(format!("{what} user and pass must be set together"));
            }
        }
        for ip in self.publish_ips.iter().chain(self.read_ips.iter()) {
            if ip.parse::<crate::auth::IpRange>().is_err() {
                return err(format!("invalid IP range '{ip}'"));
            }
        }
        for (timeout, field) in [
            (self.idle_timeout, "idleTimeout"),
            (self.run_on_demand_start_timeout, "runOnDemandStartTimeout"),
            (self.run_on_demand_close_after, "runOnDemandCloseAfter"),
        ] {
            if !timeout.is_finite() || timeout <= 0.0 {
                return err(format!("{field} must be positive"));
            }
        }
        Ok(())
    }
}

/// A configured path name: either a literal, or a pattern where `*`
/// matches exactly one segment and a final `**` matches any suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<PatternSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Wildcard,
    Rest,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, ConfError> {
        let err = |msg: &str| {
            Err(ConfError::InvalidPath(raw.to_string(), msg.to_string()))
        };

        if raw.is_empty() {
            return err("name must not be empty");
        }
        if raw.starts_with('/') || raw.ends_with('/') {
            return err("name must not begin or end with a slash");
        }

        let mut segments = Vec::new();
        let raw_segments: Vec<&str> = raw.split('/').collect();
        let last = raw_segments.len() - 1;
        for (i, seg) in raw_segments.iter().enumerate() {
            match *seg {
                "" => return err("name must not contain empty segments"),
                "*" => segments.push(PatternSegment::Wildcard),
                "**" => {
                    if i != last {
                        return err("'**' is only valid as the final segment");
                    }
                    segments.push(PatternSegment::Rest);
                }
                s => {
                    if !s
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
                    {
                        return err("segments may contain [A-Za-z0-9_-.] only");
                    }
                    segments.push(PatternSegment::Literal(s.to_string()));
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, PatternSegment::Literal(_)))
    }

    /// Characters of leading literal segments, separators included.
    /// Drives the longest-literal-prefix resolution rule.
    pub fn literal_prefix_len(&self) -> usize {
        let mut len = 0;
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                PatternSegment::Literal(s) => {
                    if i > 0 {
                        len += 1;
                    }
                    len += s.len();
                }
                _ => break,
            }
        }
        len
    }

    pub fn wildcard_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| !matches!(s, PatternSegment::Literal(_)))
            .count()
    }

    pub fn matches(&self, name: &str) -> bool {
        let name_segments: Vec<&str> = name.split('/').collect();
        let mut ni = 0;
        for seg in &self.segments {
            match seg {
                PatternSegment::Literal(s) => {
                    if ni >= name_segments.len() || name_segments[ni] != s {
                        return false;
                    }
                    ni += 1;
                }
                PatternSegment::Wildcard => {
                    if ni >= name_segments.len() {
                        return false;
                    }
                    ni += 1;
                }
                PatternSegment::Rest => return ni < name_segments.len(),
            }
        }
        ni == name_segments.len()
    }
}

/// Validity of a runtime path name (no wildcards allowed).
pub fn valid_path_name(name: &str) -> Result<(), ConfError> {
    let pattern = PathPattern::parse(name)?;
    if !pattern.is_literal() {
        return Err(ConfError::InvalidPath(
            name.to_string(),
            "name must not contain wildcards".to_string(),
        ));
    }
    Ok(())
}

/// The `paths` table of the configuration, in declaration order.
///
/// Serialized as a JSON object; deserialization preserves document order
/// so that pattern resolution can break ties by declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PathConfMap {
    entries: Vec<(String, PathConf)>,
}

impl PathConfMap {
    pub fn get(&self, name: &str) -> Option<&PathConf> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Insert or replace; a replaced entry keeps its declaration position,
    /// a new one orders last.
    pub fn insert(&mut self, name: String, conf: PathConf) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = conf,
            None => self.entries.push((name, conf)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<PathConf> {
        let idx = self.entries.iter().position(|(n, _)| n == name)?;
        Some(self.entries.remove(idx).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PathConf)> {
        self.entries.iter().map(|(n, c)| (n, c))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for PathConfMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, conf) in &self.entries {
            map.serialize_entry(name, conf)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PathConfMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl<'de> serde::de::Visitor<'de> for Visitor {
            type Value = PathConfMap;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a map of path name to path configuration")
            }

            fn visit_map<A: serde::de::MapAccess<'de>>(
                self,
                mut access: A,
            ) -> Result<Self::Value, A::Error> {
                let mut entries: Vec<(String, PathConf)> = Vec::new();
                while let Some((name, conf)) = access.next_entry::<String, PathConf>()? {
                    if entries.iter().any(|(n, _)| *n == name) {
                        return Err(serde::de::Error::custom(format!(
                            "duplicate path '{name}'"
                        )));
                    }
                    entries.push((name, conf));
                }
                Ok(PathConfMap { entries })
            }
        }

        deserializer.deserialize_map(Visitor)
    }
}
