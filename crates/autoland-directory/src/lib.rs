//! Directory-group membership for the autoland pipeline.
//!
//! Review, approval, and push authority are all gated on membership in a
//! named directory group (e.g. `scm_level_3`). Membership lives in LDAP;
//! the group a branch requires comes from a small HTTP endpoint. Users may
//! be known to the tracker under a different address than their directory
//! address, so membership checks consult both: the address as given, and
//! the directory's `mail` entry for the matching `bugzillaEmail`.

use std::time::Duration;

use autoland_retry::{RetryExecutor, RetryStrategyConfig};
use autoland_types::{AutolandError, AutolandResult};
use ldap3::{LdapConn, LdapConnSettings, Scope, SearchEntry};
use serde::{Deserialize, Serialize};

/// The directory operations the pipeline depends on.
pub trait Directory {
    /// All members (`memberUid` values) of the groups matching `group`.
    /// `group` may carry an LDAP wildcard (`scm_level_*`).
    fn group_members(&self, group: &str) -> AutolandResult<Vec<String>>;

    /// The directory `mail` address registered for a tracker email, if any.
    fn tracker_email(&self, email: &str) -> AutolandResult<Option<String>>;

    /// The directory group required to land on `branch`.
    fn branch_group(&self, branch: &str) -> AutolandResult<String>;

    /// Whether `email` itself is in `group`.
    fn member_of(&self, email: &str, group: &str) -> AutolandResult<bool> {
        Ok(self.group_members(group)?.iter().any(|m| m == email))
    }

    /// Whether `email` or its directory-mapped address is in `group`.
    fn in_group(&self, email: &str, group: &str) -> AutolandResult<bool> {
        if self.member_of(email, group)? {
            return Ok(true);
        }
        match self.tracker_email(email)? {
            Some(mapped) => self.member_of(&mapped, group),
            None => Ok(false),
        }
    }
}

/// Connection settings for [`LdapDirectory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// e.g. `ldap://directory.example.org:389`
    pub ldap_url: String,
    pub bind_dn: String,
    pub password: String,
    pub group_base: String,
    pub people_base: String,
    /// Branch-permissions HTTP endpoint.
    pub branch_api: String,
    #[serde(with = "humantime_serde")]
    pub search_timeout: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            ldap_url: String::new(),
            bind_dn: String::new(),
            password: String::new(),
            group_base: "ou=groups,dc=mozilla".into(),
            people_base: "o=com,dc=mozilla".into(),
            branch_api: String::new(),
            search_timeout: Duration::from_secs(10),
        }
    }
}

/// Escape an LDAP filter value, keeping `*` so group patterns like
/// `scm_level_*` keep working.
fn escape_filter_keep_wildcard(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\\' => out.push_str("\\5c"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

/// LDAP-backed directory client. Idle directory connections drop, so every
/// query binds a fresh connection; transient failures consume the shared
/// transport retry budget.
pub struct LdapDirectory {
    config: DirectoryConfig,
    http: reqwest::blocking::Client,
    retry: RetryStrategyConfig,
}

impl LdapDirectory {
    pub fn new(config: DirectoryConfig) -> AutolandResult<Self> {
        Self::with_retry(config, autoland_retry::RetryBudget::Transport.to_config())
    }

    pub fn with_retry(config: DirectoryConfig, retry: RetryStrategyConfig) -> AutolandResult<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(config.search_timeout)
            .build()
            .map_err(|e| AutolandError::Internal(format!("building http client: {e}")))?;
        Ok(Self {
            config,
            http,
            retry,
        })
    }

    fn search(
        &self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> AutolandResult<Vec<SearchEntry>> {
        RetryExecutor::new(self.retry.clone()).run_if(
            |_| self.search_once(base, filter, attrs),
            AutolandError::is_retryable,
        )
    }

    fn search_once(
        &self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> AutolandResult<Vec<SearchEntry>> {
        let transient = |e: ldap3::LdapError| AutolandError::Transient(format!("ldap: {e}"));

        let settings = LdapConnSettings::new().set_conn_timeout(self.config.search_timeout);
        let mut conn =
            LdapConn::with_settings(settings, &self.config.ldap_url).map_err(transient)?;
        conn.simple_bind(&self.config.bind_dn, &self.config.password)
            .map_err(transient)?
            .success()
            .map_err(transient)?;

        let (entries, _result) = conn
            .with_timeout(self.config.search_timeout)
            .search(base, Scope::Subtree, filter, attrs.to_vec())
            .map_err(transient)?
            .success()
            .map_err(transient)?;

        let _ = conn.unbind();
        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }
}

impl Directory for LdapDirectory {
    fn group_members(&self, group: &str) -> AutolandResult<Vec<String>> {
        let filter = format!("(cn={})", escape_filter_keep_wildcard(group));
        let entries = self.search(&self.config.group_base, &filter, &["memberUid"])?;

        // union of the members of every matched group
        let mut members: Vec<String> = entries
            .into_iter()
            .flat_map(|e| e.attrs.get("memberUid").cloned().unwrap_or_default())
            .collect();
        members.sort();
        members.dedup();
        Ok(members)
    }

    fn tracker_email(&self, email: &str) -> AutolandResult<Option<String>> {
        let filter = format!("(bugzillaEmail={})", escape_filter_keep_wildcard(email));
        let entries = self.search(&self.config.people_base, &filter, &["mail"])?;
        Ok(entries
            .into_iter()
            .next()
            .and_then(|e| e.attrs.get("mail").and_then(|v| v.first().cloned())))
    }

    fn branch_group(&self, branch: &str) -> AutolandResult<String> {
        let url = format!("{}?repo={branch}", self.config.branch_api);
        let body = RetryExecutor::new(self.retry.clone()).run_if(
            |_| {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .map_err(|e| AutolandError::Transient(format!("{url}: {e}")))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(AutolandError::Transient(format!("{url}: {status}")));
                }
                response
                    .text()
                    .map_err(|e| AutolandError::Transient(format!("{url}: {e}")))
            },
            AutolandError::is_retryable,
        )?;

        let body = body.trim().to_string();
        if body.contains("is not an hg repository") {
            return Err(AutolandError::NotFound(format!("branch {branch} unknown")));
        }
        if body.contains("Need a repository") || body.contains("A problem occurred") {
            return Err(AutolandError::Internal(format!(
                "branch permissions api error for {branch}: {body}"
            )));
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::thread;

    use tiny_http::{Response, Server};

    use super::*;

    /// In-memory directory used to exercise the provided trait methods.
    struct MapDirectory {
        groups: BTreeMap<String, Vec<String>>,
        mapped: BTreeMap<String, String>,
    }

    impl Directory for MapDirectory {
        fn group_members(&self, group: &str) -> AutolandResult<Vec<String>> {
            Ok(self.groups.get(group).cloned().unwrap_or_default())
        }

        fn tracker_email(&self, email: &str) -> AutolandResult<Option<String>> {
            Ok(self.mapped.get(email).cloned())
        }

        fn branch_group(&self, _branch: &str) -> AutolandResult<String> {
            Ok("scm_level_3".into())
        }
    }

    fn directory() -> MapDirectory {
        MapDirectory {
            groups: BTreeMap::from([(
                "scm_level_3".to_string(),
                vec!["alice@corp.example.org".to_string()],
            )]),
            mapped: BTreeMap::from([(
                "alice@tracker.example.org".to_string(),
                "alice@corp.example.org".to_string(),
            )]),
        }
    }

    #[test]
    fn member_of_checks_the_given_address() {
        let dir = directory();
        assert!(dir.member_of("alice@corp.example.org", "scm_level_3").unwrap());
        assert!(!dir.member_of("bob@corp.example.org", "scm_level_3").unwrap());
    }

    #[test]
    fn in_group_falls_back_to_the_mapped_email() {
        let dir = directory();
        // direct hit
        assert!(dir.in_group("alice@corp.example.org", "scm_level_3").unwrap());
        // hits only via the bugzillaEmail -> mail mapping
        assert!(dir.in_group("alice@tracker.example.org", "scm_level_3").unwrap());
        // no mapping, no membership
        assert!(!dir.in_group("mallory@tracker.example.org", "scm_level_3").unwrap());
    }

    #[test]
    fn escape_keeps_wildcards() {
        assert_eq!(escape_filter_keep_wildcard("scm_level_*"), "scm_level_*");
        assert_eq!(escape_filter_keep_wildcard("a(b)c\\d"), "a\\28b\\29c\\5cd");
    }

    fn branch_api_server(body: &'static str) -> String {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip addr");
        thread::spawn(move || {
            if let Ok(request) = server.recv() {
                let _ = request.respond(Response::from_string(body));
            }
        });
        format!("http://{addr}/ldap/checkrepoperms")
    }

    fn http_directory(branch_api: String) -> LdapDirectory {
        LdapDirectory::with_retry(
            DirectoryConfig {
                branch_api,
                ..DirectoryConfig::default()
            },
            RetryStrategyConfig {
                strategy: autoland_retry::RetryStrategyType::Immediate,
                max_attempts: 1,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                jitter: 0.0,
            },
        )
        .expect("client")
    }

    #[test]
    fn branch_group_returns_required_level() {
        let dir = http_directory(branch_api_server("scm_level_3\n"));
        assert_eq!(dir.branch_group("release").expect("group"), "scm_level_3");
    }

    #[test]
    fn branch_group_unknown_repo_is_not_found() {
        let dir = http_directory(branch_api_server("repo bogus is not an hg repository"));
        let err = dir.branch_group("bogus").unwrap_err();
        assert!(matches!(err, AutolandError::NotFound(_)));
    }

    #[test]
    fn branch_group_api_trouble_is_internal() {
        let dir = http_directory(branch_api_server("A problem occurred"));
        let err = dir.branch_group("release").unwrap_err();
        assert!(matches!(err, AutolandError::Internal(_)));
    }

    #[test]
    fn default_config_has_ten_second_timeout() {
        let config = DirectoryConfig::default();
        assert_eq!(config.search_timeout, Duration::from_secs(10));
        assert_eq!(config.group_base, "ou=groups,dc=mozilla");
        assert_eq!(config.people_base, "o=com,dc=mozilla");
    }
}
