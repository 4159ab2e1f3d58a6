use std::collections::HashSet;

pub const DEFAULT_EXCLUDED_EMAILS: &[&str] = &["plugins@soaringleads.com"];

/// Hosts whose part after the first label marks a development or staging site.
pub const DEFAULT_EXCLUDED_DOMAINS: &[&str] = &[
    "local",
    "localhost",
    "host",
    "dev",
    "instawp.xyz",
    "instawp.co",
    "instawp.link",
    "dev.cc",
    "test",
    "staging",
    "example",
    "invalid",
    "myftpupload.com",
    "cloudwaysapps.com",
    "wpsandbox.pro",
    "ngrok.io",
    "mystagingwebsite.com",
    "tempurl.host",
    "wpmudev.host",
    "websitepro-staging.com",
    "websitepro.hosting",
    "wpengine.com",
    "pantheonsite.io",
    "kinsta.com",
    "kinsta.cloud",
];

/// Exclusion rules applied by the validation gate.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    excluded_emails: HashSet<String>,
    excluded_domains: HashSet<String>,
}

impl Filters {
    pub fn new<E, D>(emails: E, domains: D) -> Self
    where
        E: IntoIterator,
        E::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        Self {
            excluded_emails: emails.into_iter().map(Into::into).collect(),
            excluded_domains: domains.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(
            DEFAULT_EXCLUDED_EMAILS.iter().copied(),
            DEFAULT_EXCLUDED_DOMAINS.iter().copied(),
        )
    }

    /// Exact match only.
    pub fn is_excluded_email(&self, email: &str) -> bool {
        self.excluded_emails.contains(email)
    }

    /// Splits on the first `.` and exact-matches the remainder against the
    /// denylist. Values without a dot are never excluded. The value is used
    /// as sent, scheme included, so `https://site.local` splits to `local`.
    pub fn is_excluded_domain(&self, url: &str) -> bool {
        match url.split_once('.') {
            Some((_, rest)) => self.excluded_domains.contains(rest),
            None => false,
        }
    }
}
