use std::fmt;
use std::time::Duration;
use anyhow::{Context, Result};
use rayon::prelude::*;
use regex::Regex;
use reqwest::blocking::Client;
use semver::Version;
use serde::Deserialize;
use tracing::{debug, warn};
use crate::error::LivecheckError;
use crate::formula::{Formula, LivecheckStrategy};

/// An `owner/name` repository on the code forge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

impl RepoRef {
    /// Extracts the repository from a GitHub project, archive, or release URL.
    ///
    /// Returns `None` for other hosts.
    pub fn from_url(url: &str) -> Option<RepoRef> {
        let parsed = reqwest::Url::parse(url).ok()?;
        if !matches!(parsed.host_str()?, "github.com" | "www.github.com") {
            return None;
        }
        let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
        let owner = segments.next()?.to_string();
        let name = segments.next()?.trim_end_matches(".git").to_string();
        Some(RepoRef { owner, name })
    }
}

/// One release as listed by the forge.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamRelease {
    #[serde(rename = "tag_name")]
    pub tag: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub prerelease: bool,
}

/// Read access to a forge's release and tag listings.
pub trait ReleaseSource: Send + Sync {
    fn releases(&self, repo: &RepoRef) -> Result<Vec<UpstreamRelease>>;
    fn tags(&self, repo: &RepoRef) -> Result<Vec<String>>;
}

/// [`ReleaseSource`] backed by the GitHub REST API.
pub struct GitHubReleases {
    client: Client,
    api_base: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct GitHubTag {
    name: String,
}

impl GitHubReleases {
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("formulary/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty()),
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut request = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let resp = request
            .send()
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()?;
        resp.json().with_context(|| format!("decoding {url}"))
    }
}

impl ReleaseSource for GitHubReleases {
    fn releases(&self, repo: &RepoRef) -> Result<Vec<UpstreamRelease>> {
        self.get_json(&format!("{}/repos/{repo}/releases?per_page=100", self.api_base))
    }

    fn tags(&self, repo: &RepoRef) -> Result<Vec<String>> {
        let tags: Vec<GitHubTag> = self.get_json(&format!("{}/repos/{repo}/tags?per_page=100", self.api_base))?;
        Ok(tags.into_iter().map(|t| t.name).collect())
    }
}

/// Advisory result of comparing a formula with its upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    pub name: String,
    pub current: Version,
    pub upstream: Version,
    pub is_stale: bool,
}

/// Parses a tag with the given versioning scheme.
///
/// The version is capture group 1 when the scheme has one, otherwise the
/// whole match. Tags that do not match, or whose version is not SemVer,
/// yield `None`.
pub fn parse_tag(tag: &str, scheme: &Regex) -> Option<Version> {
    let captures = scheme.captures(tag.trim())?;
    let text = captures.get(1).or_else(|| captures.get(0))?.as_str();
    Version::parse(text).ok()
}

/// Returns the highest version among `tags`, skipping non-candidates.
///
/// SemVer pre-releases are only candidates when `allow_prerelease` is set.
pub fn highest_version<'a, I>(tags: I, scheme: &Regex, allow_prerelease: bool) -> Option<Version>
where
    I: IntoIterator<Item = &'a str>,
{
    tags.into_iter()
        .filter_map(|tag| {
            let parsed = parse_tag(tag, scheme);
            if parsed.is_none() {
                debug!(tag, "ignoring tag outside the versioning scheme");
            }
            parsed
        })
        .filter(|version| allow_prerelease || version.pre.is_empty())
        .max()
}

/// Compares declared formula versions with the newest upstream releases.
///
/// Never mutates the store; results are advisory.
pub struct VersionResolver<S> {
    source: S,
}

impl<S: ReleaseSource> VersionResolver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn check_for_update(&self, formula: &Formula) -> Result<UpdateStatus, LivecheckError> {
        let name = formula.name.clone();
        let strategy = formula.livecheck.strategy;
        if strategy == LivecheckStrategy::Skip {
            return Err(LivecheckError::Skipped { name });
        }
        let url = formula.livecheck_url();
        let repo = RepoRef::from_url(url).ok_or_else(|| LivecheckError::UnsupportedSource {
            name: name.clone(),
            url: url.to_string(),
        })?;
        // The scheme is validated on registration; an unvalidated record with
        // a broken pattern surfaces as no matching tag.
        let scheme = Regex::new(formula.tag_scheme())
            .map_err(|_| LivecheckError::NoMatchingTag { name: name.clone() })?;
        let unavailable = |e: anyhow::Error| LivecheckError::UpstreamUnavailable {
            name: name.clone(),
            reason: format!("{e:#}"),
        };

        let allow_prerelease = !formula.version.pre.is_empty();
        let upstream = match strategy {
            LivecheckStrategy::LatestReleaseTag => {
                let releases = self.source.releases(&repo).map_err(unavailable)?;
                highest_version(
                    releases
                        .iter()
                        .filter(|r| !r.draft && !r.prerelease)
                        .map(|r| r.tag.as_str()),
                    &scheme,
                    allow_prerelease,
                )
            }
            LivecheckStrategy::GitTags => {
                let tags = self.source.tags(&repo).map_err(unavailable)?;
                highest_version(tags.iter().map(String::as_str), &scheme, allow_prerelease)
            }
            LivecheckStrategy::Skip => None,
        }
        .ok_or_else(|| LivecheckError::NoMatchingTag { name: name.clone() })?;

        debug!(name = %name, repo = %repo, current = %formula.version, upstream = %upstream, "livecheck");
        Ok(UpdateStatus {
            is_stale: upstream > formula.version,
            name,
            current: formula.version.clone(),
            upstream,
        })
    }

    /// Like [`check_for_update`](Self::check_for_update), retrying
    /// [`LivecheckError::UpstreamUnavailable`] up to `retries` more times and
    /// doubling `delay` after each attempt.
    pub fn check_with_retry(
        &self,
        formula: &Formula,
        retries: u32,
        delay: Duration,
    ) -> Result<UpdateStatus, LivecheckError> {
        let mut delay = delay;
        let mut attempt = 0;
        loop {
            match self.check_for_update(formula) {
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    warn!(name = %formula.name, attempt, error = %e, "upstream unavailable, retrying");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                result => return result,
            }
        }
    }

    /// Checks every formula in parallel, one result per formula in input order.
    pub fn check_all(
        &self,
        formulas: &[Formula],
        retries: u32,
        delay: Duration,
    ) -> Vec<Result<UpdateStatus, LivecheckError>> {
        formulas
            .par_iter()
            .map(|formula| self.check_with_retry(formula, retries, delay))
            .collect()
    }
}
