use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{MirrorConfig, SiteTarget};
use crate::error::{EXIT_OK, EXIT_PARTIAL, exit_code_for};
use crate::names::{
    NameTable, canonicalize_name, is_internal_page, to_local_name, to_wiki_name,
    validate_local_name,
};
use crate::record::FIELD_FULLNAME;
use crate::remote::{WikiRemote, WikidotClient, WikidotClientConfig};
use crate::store::LocalStore;
use crate::timestamp::is_remote_newer;

/// How the recency scan walks the listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Stop at the first page that is not newer than its local copy.
    #[default]
    RecencyHeuristic,
    /// Probe every listed page and fetch the ones that are newer.
    Exhaustive,
    /// Skip the scan; only the reconcile phases run.
    None,
}

impl ScanMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecencyHeuristic => "recency_heuristic",
            Self::Exhaustive => "exhaustive",
            Self::None => "none",
        }
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScanMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "recency" | "recency_heuristic" => Ok(Self::RecencyHeuristic),
            "exhaustive" | "full" => Ok(Self::Exhaustive),
            "none" => Ok(Self::None),
            other => Err(anyhow!(
                "unknown scan mode '{other}' (expected recency, exhaustive or none)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncOptions {
    pub scan_mode: ScanMode,
    pub reconcile_missing: bool,
    pub reconcile_deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageAction {
    Fetched,
    UpToDate,
    MissingFetched,
    Deleted,
    Error,
}

impl PageAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::UpToDate => "up_to_date",
            Self::MissingFetched => "missing_fetched",
            Self::Deleted => "deleted",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageSyncResult {
    pub name: String,
    pub action: PageAction,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub site: String,
    pub success: bool,
    pub scan_mode: ScanMode,
    pub listed: usize,
    pub scanned: usize,
    pub fetched: usize,
    pub up_to_date: usize,
    pub skipped_internal: usize,
    pub missing_fetched: usize,
    pub deleted: usize,
    pub attachments: usize,
    pub stopped_early: bool,
    pub errors: Vec<String>,
    pub pages: Vec<PageSyncResult>,
    pub request_count: usize,
}

impl SyncReport {
    fn new(site: &str, scan_mode: ScanMode) -> Self {
        Self {
            site: site.to_string(),
            success: true,
            scan_mode,
            listed: 0,
            scanned: 0,
            fetched: 0,
            up_to_date: 0,
            skipped_internal: 0,
            missing_fetched: 0,
            deleted: 0,
            attachments: 0,
            stopped_early: false,
            errors: Vec::new(),
            pages: Vec::new(),
            request_count: 0,
        }
    }

    fn push(&mut self, name: &str, action: PageAction, detail: Option<String>) {
        self.pages.push(PageSyncResult {
            name: name.to_string(),
            action,
            detail,
        });
    }

    fn push_error(&mut self, name: &str, message: String) {
        self.errors.push(format!("{name}: {message}"));
        self.push(name, PageAction::Error, Some(message));
    }

    fn record_download(&mut self, name: &str, action: PageAction, download: PageDownload) {
        self.attachments += download.attachments;
        self.errors.extend(download.errors);
        let mut details = Vec::new();
        if let Some(destination) = download.redirect {
            details.push(format!("redirect -> {destination}"));
        }
        if download.attachments > 0 {
            details.push(format!("{} attachments", download.attachments));
        }
        let detail = (!details.is_empty()).then(|| details.join(", "));
        self.push(name, action, detail);
    }
}

/// Outcome of mirroring one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDownload {
    pub local_name: String,
    /// Remote `updated_at` is strictly later than the local copy was before the write.
    pub newer: bool,
    pub attachments: usize,
    pub redirect: Option<String>,
    pub errors: Vec<String>,
}

struct ListedPage {
    raw: String,
    local: String,
}

/// Mirrors one site into a local store.
pub struct SyncEngine<'a, A: WikiRemote> {
    site: String,
    remote: &'a mut A,
    store: LocalStore,
    names: NameTable,
    options: SyncOptions,
}

impl<'a, A: WikiRemote> SyncEngine<'a, A> {
    pub fn new(site: &str, remote: &'a mut A, store: LocalStore, options: SyncOptions) -> Self {
        Self {
            site: site.to_string(),
            remote,
            store,
            names: NameTable::new(),
            options,
        }
    }

    pub fn names(&self) -> &NameTable {
        &self.names
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn run(&mut self) -> Result<SyncReport> {
        let mut report = SyncReport::new(&self.site, self.options.scan_mode);

        info!(site = %self.site, "listing pages, most recently updated first");
        let raw_names = self
            .remote
            .list_all_page_names(&self.site, true)
            .with_context(|| format!("failed to list pages of {}", self.site))?;
        let listed = self.prepare_listing(raw_names, &mut report);
        info!(site = %self.site, pages = report.listed, "listing complete");

        if self.options.scan_mode != ScanMode::None {
            self.scan(&listed, &mut report)?;
        }
        if self.options.reconcile_missing {
            self.reconcile_missing(&listed, &mut report)?;
        }
        if self.options.reconcile_deleted {
            self.reconcile_deleted(&listed, &mut report)?;
        }

        report.request_count = self.remote.request_count();
        report.success = report.errors.is_empty();
        info!(
            site = %self.site,
            fetched = report.fetched,
            missing = report.missing_fetched,
            deleted = report.deleted,
            errors = report.errors.len(),
            "sync finished"
        );
        Ok(report)
    }

    /// Mirror one page: source, markup, metadata, then attachments.
    pub fn download_page(&mut self, raw_name: &str) -> Result<PageDownload> {
        let local_name = to_local_name(raw_name);
        validate_local_name(&local_name)?;
        info!(site = %self.site, page = raw_name, "downloading page");

        let local_updated = self.store.read_local_updated_at(&local_name)?;
        let record = self
            .remote
            .fetch_page(&self.site, raw_name)
            .with_context(|| format!("failed to fetch page {raw_name}"))?;

        if let Some(source) = record.content() {
            self.store.write_source(&local_name, source)?;
        }
        if let Some(markup) = record.html() {
            self.store.write_markup(&local_name, markup)?;
        }
        let remote_updated = self.store.write_metadata(&local_name, &record)?;

        if let Some(fullname) = record.text(FIELD_FULLNAME) {
            let canonical = canonicalize_name(fullname);
            self.names.record_raw_form(fullname, &canonical);
        }
        let redirect = record
            .content()
            .and_then(|source| self.names.is_redirect(source));

        let mut download = PageDownload {
            local_name,
            newer: false,
            attachments: 0,
            redirect,
            errors: Vec::new(),
        };
        self.download_attachments(raw_name, &mut download)?;

        download.newer = is_remote_newer(remote_updated.as_deref(), local_updated.as_deref())
            .with_context(|| format!("failed to compare update times of {raw_name}"))?;
        Ok(download)
    }

    fn prepare_listing(&mut self, raw_names: Vec<String>, report: &mut SyncReport) -> Vec<ListedPage> {
        report.listed = raw_names.len();
        let mut listed = Vec::with_capacity(raw_names.len());
        for raw in raw_names {
            self.names.canonicalize(&raw);
            let local = to_local_name(&raw);
            if let Err(error) = validate_local_name(&local) {
                warn!(site = %self.site, page = %raw, "skipping page with unsafe local name");
                report.push_error(&raw, format!("{error:#}"));
                continue;
            }
            listed.push(ListedPage { raw, local });
        }
        listed
    }

    fn scan(&mut self, listed: &[ListedPage], report: &mut SyncReport) -> Result<()> {
        let recency = self.options.scan_mode == ScanMode::RecencyHeuristic;
        for page in listed {
            if is_internal_page(&page.raw) {
                debug!(page = %page.raw, "skipping internal page");
                report.skipped_internal += 1;
                continue;
            }
            report.scanned += 1;

            let local_updated = self.store.read_local_updated_at(&page.local)?;
            let probe = self
                .remote
                .fetch_page_meta(&self.site, &page.raw)
                .with_context(|| format!("failed to probe page {}", page.raw))?;
            let remote_newer = is_remote_newer(probe.updated_at(), local_updated.as_deref())
                .with_context(|| format!("failed to compare update times of {}", page.raw))?;
            // A page with no local copy is always mirrored, even without an update time.
            let first_copy = !self.store.metadata_path(&page.local).is_file();
            let newer = remote_newer || first_copy;

            if !newer {
                report.up_to_date += 1;
                report.push(&page.raw, PageAction::UpToDate, None);
                if recency {
                    info!(page = %page.raw, "page is up to date; ending scan");
                    report.stopped_early = true;
                    break;
                }
                continue;
            }

            let download = self.download_page(&page.raw)?;
            let still_newer = download.newer || first_copy;
            report.fetched += 1;
            report.record_download(&page.raw, PageAction::Fetched, download);
            if recency && !still_newer {
                info!(page = %page.raw, "page did not advance; ending scan");
                report.stopped_early = true;
                break;
            }
        }
        Ok(())
    }

    fn reconcile_missing(&mut self, listed: &[ListedPage], report: &mut SyncReport) -> Result<()> {
        let local_pages = self.store.list_local_page_names()?;
        let missing = listed
            .iter()
            .filter(|page| !is_internal_page(&page.raw) && !local_pages.contains(&page.local))
            .collect::<Vec<_>>();
        if missing.is_empty() {
            info!(site = %self.site, "there are no missing pages");
            return Ok(());
        }
        info!(site = %self.site, count = missing.len(), "downloading missing pages");
        for page in missing {
            let download = self.download_page(&page.raw)?;
            report.missing_fetched += 1;
            report.record_download(&page.raw, PageAction::MissingFetched, download);
        }
        Ok(())
    }

    fn reconcile_deleted(&mut self, listed: &[ListedPage], report: &mut SyncReport) -> Result<()> {
        let local_pages = self.store.list_local_page_names()?;
        if listed.is_empty() && !local_pages.is_empty() {
            warn!(site = %self.site, "remote listing is empty; not deleting local pages");
            report.errors.push(format!(
                "remote listing is empty; kept {} local pages",
                local_pages.len()
            ));
            return Ok(());
        }
        let remote_pages = listed
            .iter()
            .map(|page| page.local.as_str())
            .collect::<BTreeSet<_>>();
        let deleted = local_pages
            .into_iter()
            .filter(|local| !remote_pages.contains(local.as_str()))
            .collect::<Vec<_>>();
        if deleted.is_empty() {
            info!(site = %self.site, "there are no pages to delete");
            return Ok(());
        }
        for local_name in deleted {
            let wiki_name = to_wiki_name(&local_name);
            info!(site = %self.site, page = %wiki_name, "removing local copy of deleted page");
            let removed = self.store.delete_local_page(&local_name)?;
            report.deleted += 1;
            report.push(
                &wiki_name,
                PageAction::Deleted,
                Some(format!("{removed} files removed")),
            );
        }
        Ok(())
    }

    fn download_attachments(&mut self, raw_name: &str, download: &mut PageDownload) -> Result<()> {
        let attachments = self
            .remote
            .list_attachments(&self.site, raw_name)
            .with_context(|| format!("failed to list attachments of {raw_name}"))?;
        if attachments.is_empty() {
            return Ok(());
        }
        self.store.ensure_attachment_dir(&download.local_name)?;
        for attachment in &attachments {
            match self.download_attachment(raw_name, &download.local_name, attachment) {
                Ok(()) => download.attachments += 1,
                Err(error) => {
                    warn!(page = raw_name, attachment = %attachment, "attachment failed: {error:#}");
                    download
                        .errors
                        .push(format!("{raw_name}/{attachment}: {error:#}"));
                }
            }
        }
        Ok(())
    }

    fn download_attachment(&mut self, raw_name: &str, local_name: &str, attachment: &str) -> Result<()> {
        let record = self
            .remote
            .fetch_attachment_meta(&self.site, raw_name, attachment)?;
        debug!(attachment, url = %record.download_url, "fetching attachment");
        let bytes = self.remote.download_bytes(&record.download_url)?;
        self.store.write_attachment(local_name, &record, &bytes)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteOutcome {
    pub site: String,
    pub exit_code: u8,
    pub error: Option<String>,
    pub report: Option<SyncReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MultiSyncReport {
    pub success: bool,
    pub sites: Vec<SiteOutcome>,
}

impl MultiSyncReport {
    /// 0 when every site succeeded; a shared failure code when every site
    /// failed the same way; otherwise the partial-failure code.
    pub fn exit_code(&self) -> u8 {
        let failed = self
            .sites
            .iter()
            .filter(|site| site.exit_code != EXIT_OK)
            .collect::<Vec<_>>();
        let Some(first) = failed.first() else {
            return EXIT_OK;
        };
        if failed.len() == self.sites.len()
            && failed.iter().all(|site| site.exit_code == first.exit_code)
        {
            first.exit_code
        } else {
            EXIT_PARTIAL
        }
    }
}

/// Sync every target in turn. A failing site is recorded and the rest still run.
pub fn run_multi<A, F>(
    targets: &[SiteTarget],
    output_root: &Path,
    options: SyncOptions,
    mut connect: F,
) -> MultiSyncReport
where
    A: WikiRemote,
    F: FnMut(&SiteTarget) -> Result<A>,
{
    let mut sites = Vec::with_capacity(targets.len());
    for target in targets {
        info!(endpoint = %target, "syncing site");
        let outcome = match sync_site(target, output_root, options, &mut connect) {
            Ok(report) => SiteOutcome {
                site: target.site.clone(),
                exit_code: if report.success { EXIT_OK } else { EXIT_PARTIAL },
                error: None,
                report: Some(report),
            },
            Err(error) => {
                warn!(site = %target.site, "site sync failed: {error:#}");
                SiteOutcome {
                    site: target.site.clone(),
                    exit_code: exit_code_for(&error),
                    error: Some(format!("{error:#}")),
                    report: None,
                }
            }
        };
        sites.push(outcome);
    }
    MultiSyncReport {
        success: sites.iter().all(|site| site.exit_code == EXIT_OK),
        sites,
    }
}

/// Sync every target against the live Wikidot API.
pub fn pull_sites(
    targets: &[SiteTarget],
    output_root: &Path,
    config: &MirrorConfig,
    options: SyncOptions,
) -> MultiSyncReport {
    run_multi(targets, output_root, options, |target| {
        WikidotClient::new(WikidotClientConfig::for_target(target, config))
    })
}

fn sync_site<A, F>(
    target: &SiteTarget,
    output_root: &Path,
    options: SyncOptions,
    connect: &mut F,
) -> Result<SyncReport>
where
    A: WikiRemote,
    F: FnMut(&SiteTarget) -> Result<A>,
{
    let mut remote = connect(target)?;
    let store = LocalStore::open(output_root, &target.site)?;
    SyncEngine::new(&target.site, &mut remote, store, options).run()
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::error::{EXIT_TIMESTAMP, EXIT_TRANSPORT, MirrorError};
    use crate::record::{AttachmentRecord, PageRecord};

    #[derive(Debug, Clone, Default)]
    struct MockRemote {
        listing: Vec<String>,
        pages: BTreeMap<String, PageRecord>,
        attachments: BTreeMap<String, Vec<String>>,
        attachment_meta: BTreeMap<String, AttachmentRecord>,
        files: BTreeMap<String, Vec<u8>>,
        fetched: Vec<String>,
        probed: Vec<String>,
        request_count: usize,
    }

    impl MockRemote {
        fn with_page(mut self, name: &str, updated_at: &str, content: &str) -> Self {
            self.listing.push(name.to_string());
            self.pages.insert(
                name.to_string(),
                PageRecord::new()
                    .with_text("fullname", name)
                    .with_text("title", name)
                    .with_text("content", content)
                    .with_text("html", format!("<p>{content}</p>"))
                    .with_text("updated_at", updated_at)
                    .with_list("tags", ["tag"]),
            );
            self
        }

        fn with_attachment(mut self, page: &str, name: &str, bytes: &[u8]) -> Self {
            let url = format!("http://files.example/{page}/{name}");
            self.attachments
                .entry(page.to_string())
                .or_default()
                .push(name.to_string());
            self.attachment_meta.insert(
                format!("{page}/{name}"),
                AttachmentRecord {
                    name: name.to_string(),
                    download_url: url.clone(),
                    metadata: PageRecord::new()
                        .with_text("name", name)
                        .with_text("size", bytes.len().to_string())
                        .with_text("html", "<a>preview</a>")
                        .with_text("download_url", url.clone()),
                },
            );
            self.files.insert(url, bytes.to_vec());
            self
        }
    }

    impl WikiRemote for MockRemote {
        fn list_all_page_names(&mut self, _site: &str, _desc: bool) -> Result<Vec<String>> {
            self.request_count += 1;
            Ok(self.listing.clone())
        }

        fn fetch_page(&mut self, _site: &str, raw_name: &str) -> Result<PageRecord> {
            self.request_count += 1;
            self.fetched.push(raw_name.to_string());
            self.pages
                .get(raw_name)
                .cloned()
                .ok_or_else(|| anyhow!(MirrorError::RemoteFault {
                    code: 406,
                    message: format!("no page {raw_name}"),
                }))
        }

        fn fetch_page_meta(&mut self, _site: &str, raw_name: &str) -> Result<PageRecord> {
            self.request_count += 1;
            self.probed.push(raw_name.to_string());
            let page = self
                .pages
                .get(raw_name)
                .ok_or_else(|| anyhow!("no page {raw_name}"))?;
            let mut meta = PageRecord::new();
            for (name, value) in page.metadata_fields() {
                meta.insert(name, value.clone());
            }
            Ok(meta)
        }

        fn list_attachments(&mut self, _site: &str, raw_name: &str) -> Result<Vec<String>> {
            self.request_count += 1;
            Ok(self.attachments.get(raw_name).cloned().unwrap_or_default())
        }

        fn fetch_attachment_meta(
            &mut self,
            _site: &str,
            raw_name: &str,
            attachment: &str,
        ) -> Result<AttachmentRecord> {
            self.request_count += 1;
            self.attachment_meta
                .get(&format!("{raw_name}/{attachment}"))
                .cloned()
                .ok_or_else(|| anyhow!("no attachment {attachment}"))
        }

        fn download_bytes(&mut self, url: &str) -> Result<Vec<u8>> {
            self.request_count += 1;
            self.files.get(url).cloned().ok_or_else(|| {
                anyhow!(MirrorError::Transport(format!(
                    "download of {url} failed with HTTP 404 Not Found"
                )))
            })
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    fn seed_local_page(store: &LocalStore, name: &str, updated_at: &str, body: &str) {
        store.write_source(name, body).expect("seed source");
        store
            .write_metadata(
                name,
                &PageRecord::new()
                    .with_text("fullname", name)
                    .with_text("updated_at", updated_at),
            )
            .expect("seed metadata");
    }

    fn options(scan_mode: ScanMode) -> SyncOptions {
        SyncOptions {
            scan_mode,
            ..SyncOptions::default()
        }
    }

    #[test]
    fn recency_scan_stops_at_first_current_page() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        seed_local_page(&store, "PageA", "2020-01-01T00:00:00+00:00", "old local body");
        let source_before = fs::read(store.source_path("PageA")).expect("read source");
        let metadata_before = fs::read(store.metadata_path("PageA")).expect("read metadata");

        let mut remote = MockRemote::default()
            .with_page("PageC", "2024-03-01T00:00:00+00:00", "C body")
            .with_page("PageB", "2024-01-01T00:00:00+00:00", "B body")
            .with_page("PageA", "2020-01-01T00:00:00+00:00", "A body");

        let report = SyncEngine::new("site", &mut remote, store.clone(), options(ScanMode::RecencyHeuristic))
            .run()
            .expect("sync");

        assert_eq!(remote.fetched, vec!["PageC".to_string(), "PageB".to_string()]);
        assert!(report.stopped_early);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.up_to_date, 1);
        assert!(report.success);
        assert_eq!(fs::read(store.source_path("PageA")).expect("source"), source_before);
        assert_eq!(fs::read(store.metadata_path("PageA")).expect("metadata"), metadata_before);
        assert_eq!(
            fs::read_to_string(store.source_path("PageC")).expect("page c"),
            "C body"
        );
        assert_eq!(
            fs::read_to_string(store.markup_path("PageB")).expect("page b"),
            "<p>B body</p>"
        );
        assert_eq!(
            store.read_local_updated_at("PageC").expect("updated_at").as_deref(),
            Some("2024-03-01T00:00:00+00:00")
        );
        assert_eq!(report.request_count, remote.request_count);
    }

    #[test]
    fn exhaustive_scan_continues_past_current_pages() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        seed_local_page(&store, "PageB", "2023-06-01T00:00:00+00:00", "current");
        seed_local_page(&store, "PageA", "2019-01-01T00:00:00+00:00", "stale");

        let mut remote = MockRemote::default()
            .with_page("PageC", "2024-03-01T00:00:00+00:00", "C body")
            .with_page("PageB", "2023-06-01T00:00:00+00:00", "B body")
            .with_page("PageA", "2020-01-01T00:00:00+00:00", "A body");

        let report = SyncEngine::new("site", &mut remote, store.clone(), options(ScanMode::Exhaustive))
            .run()
            .expect("sync");

        assert_eq!(remote.fetched, vec!["PageC".to_string(), "PageA".to_string()]);
        assert_eq!(remote.probed.len(), 3);
        assert!(!report.stopped_early);
        assert_eq!(report.fetched, 2);
        assert_eq!(report.up_to_date, 1);
        assert_eq!(
            fs::read_to_string(store.source_path("PageB")).expect("page b"),
            "current"
        );
        assert_eq!(
            fs::read_to_string(store.source_path("PageA")).expect("page a"),
            "A body"
        );
    }

    #[test]
    fn reconcile_fetches_missing_and_removes_deleted_pages() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        seed_local_page(&store, "Orphan", "2020-01-01T00:00:00+00:00", "gone remotely");
        store.write_markup("Orphan", "<p>gone</p>").expect("markup");

        let mut remote =
            MockRemote::default().with_page("NewPage", "2024-01-01T00:00:00+00:00", "fresh");
        let sync_options = SyncOptions {
            scan_mode: ScanMode::None,
            reconcile_missing: true,
            reconcile_deleted: true,
        };

        let report = SyncEngine::new("site", &mut remote, store.clone(), sync_options)
            .run()
            .expect("sync");

        assert_eq!(remote.fetched, vec!["NewPage".to_string()]);
        assert!(remote.probed.is_empty());
        assert_eq!(report.missing_fetched, 1);
        assert_eq!(report.deleted, 1);
        assert!(!store.source_path("Orphan").exists());
        assert!(!store.markup_path("Orphan").exists());
        assert!(!store.metadata_path("Orphan").exists());
        assert!(store.source_path("NewPage").is_file());
        assert!(store.metadata_path("NewPage").is_file());
        let deleted = report
            .pages
            .iter()
            .find(|page| page.action == PageAction::Deleted)
            .expect("deleted entry");
        assert_eq!(deleted.name, "Orphan");
        assert_eq!(deleted.detail.as_deref(), Some("3 files removed"));
    }

    #[test]
    fn empty_listing_never_wipes_the_mirror() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        seed_local_page(&store, "Keep", "2020-01-01T00:00:00+00:00", "keep me");

        let mut remote = MockRemote::default();
        let sync_options = SyncOptions {
            scan_mode: ScanMode::None,
            reconcile_missing: false,
            reconcile_deleted: true,
        };
        let report = SyncEngine::new("site", &mut remote, store.clone(), sync_options)
            .run()
            .expect("sync");

        assert!(store.source_path("Keep").is_file());
        assert_eq!(report.deleted, 0);
        assert!(!report.success);
    }

    #[test]
    fn attachments_are_written_with_sidecars() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        let mut remote = MockRemote::default()
            .with_page("Gallery", "2024-01-01T00:00:00+00:00", "pictures")
            .with_attachment("Gallery", "a.png", b"png bytes")
            .with_attachment("Gallery", "b.pdf", b"pdf bytes");

        let report = SyncEngine::new("site", &mut remote, store.clone(), options(ScanMode::RecencyHeuristic))
            .run()
            .expect("sync");

        assert_eq!(report.attachments, 2);
        let dir = store.attachment_dir("Gallery");
        let files = fs::read_dir(&dir)
            .expect("read attachment dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .collect::<BTreeSet<_>>();
        let expected = ["a.png", "a.png.xml", "b.pdf", "b.pdf.xml"]
            .into_iter()
            .map(str::to_string)
            .collect::<BTreeSet<_>>();
        assert_eq!(files, expected);
        assert_eq!(fs::read(dir.join("a.png")).expect("a.png"), b"png bytes");
        let sidecar = fs::read_to_string(dir.join("b.pdf.xml")).expect("sidecar");
        assert!(sidecar.contains("<size>9</size>"));
        assert!(!sidecar.contains("<html>"));
        assert!(!sidecar.contains("preview"));
    }

    #[test]
    fn failed_attachment_does_not_stop_the_page() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        let mut remote = MockRemote::default()
            .with_page("Gallery", "2024-01-01T00:00:00+00:00", "pictures")
            .with_attachment("Gallery", "a.png", b"png bytes")
            .with_attachment("Gallery", "b.pdf", b"pdf bytes");
        remote.files.remove("http://files.example/Gallery/a.png");

        let report = SyncEngine::new("site", &mut remote, store.clone(), options(ScanMode::RecencyHeuristic))
            .run()
            .expect("sync");

        assert_eq!(report.attachments, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("Gallery/a.png"));
        assert!(!report.success);
        assert!(store.source_path("Gallery").is_file());
        assert!(store.attachment_dir("Gallery").join("b.pdf").is_file());
        assert!(!store.attachment_dir("Gallery").join("a.png").exists());
    }

    #[test]
    fn internal_pages_are_skipped() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        let mut remote = MockRemote::default()
            .with_page("_admin", "2024-02-01T00:00:00+00:00", "secret")
            .with_page("start", "2024-01-01T00:00:00+00:00", "welcome");

        let report = SyncEngine::new("site", &mut remote, store.clone(), options(ScanMode::Exhaustive))
            .run()
            .expect("sync");

        assert_eq!(remote.fetched, vec!["start".to_string()]);
        assert_eq!(report.skipped_internal, 1);
        assert!(!store.source_path("_admin").exists());
    }

    #[test]
    fn category_pages_map_to_local_names() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        let mut remote = MockRemote::default()
            .with_page("fans:joe-smith", "2024-01-01T00:00:00+00:00", "joe")
            .with_page("con", "2023-01-01T00:00:00+00:00", "reserved");

        let mut engine =
            SyncEngine::new("site", &mut remote, store.clone(), options(ScanMode::Exhaustive));
        engine.run().expect("sync");
        assert!(!engine.names().is_empty());

        assert!(store.source_path("fans_joe-smith").is_file());
        assert!(store.source_path("con-").is_file());
        let local = store.list_local_page_names().expect("list");
        assert!(local.contains("con-"));
    }

    #[test]
    fn redirects_are_reported() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        let mut remote = MockRemote::default().with_page(
            "old-name",
            "2024-01-01T00:00:00+00:00",
            "[[module Redirect destination=\"new-name\"]]",
        );

        let report = SyncEngine::new("site", &mut remote, store, options(ScanMode::RecencyHeuristic))
            .run()
            .expect("sync");

        let page = report.pages.first().expect("page");
        assert_eq!(page.action, PageAction::Fetched);
        assert_eq!(page.detail.as_deref(), Some("redirect -> new-name"));
    }

    #[test]
    fn malformed_remote_timestamp_aborts_the_site() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        let mut remote =
            MockRemote::default().with_page("PageA", "2024-01-01 00:00:00", "no suffix");

        let error = SyncEngine::new("site", &mut remote, store, options(ScanMode::RecencyHeuristic))
            .run()
            .expect_err("must fail");
        assert_eq!(exit_code_for(&error), EXIT_TIMESTAMP);
    }

    #[test]
    fn download_page_reports_whether_remote_was_newer() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        let mut remote =
            MockRemote::default().with_page("PageA", "2024-01-01T00:00:00+00:00", "body");

        let mut engine = SyncEngine::new("site", &mut remote, store, options(ScanMode::None));
        let first = engine.download_page("PageA").expect("first");
        assert!(first.newer);
        assert_eq!(first.local_name, "PageA");
        let second = engine.download_page("PageA").expect("second");
        assert!(!second.newer);
        assert!(engine.store().source_path("PageA").is_file());
    }

    #[test]
    fn run_multi_isolates_failing_sites() {
        let temp = tempdir().expect("tempdir");
        let endpoint = "https://www.wikidot.com/xml-rpc-api.php";
        let targets = vec![
            SiteTarget::new("broken", "key", endpoint).expect("target"),
            SiteTarget::new("good", "key", endpoint).expect("target"),
        ];
        let remote =
            MockRemote::default().with_page("start", "2024-01-01T00:00:00+00:00", "welcome");

        let report = run_multi(&targets, temp.path(), SyncOptions::default(), |target| {
            if target.site == "broken" {
                Err(anyhow!(MirrorError::Transport("connection refused".to_string())))
            } else {
                Ok(remote.clone())
            }
        });

        assert!(!report.success);
        assert_eq!(report.sites.len(), 2);
        assert_eq!(report.sites[0].exit_code, EXIT_TRANSPORT);
        assert!(report.sites[0].report.is_none());
        assert_eq!(report.sites[1].exit_code, EXIT_OK);
        assert!(temp.path().join("good").join("start.txt").is_file());
        assert_eq!(report.exit_code(), EXIT_PARTIAL);
    }

    #[test]
    fn page_without_update_time_is_mirrored_when_missing_locally() {
        for scan_mode in [ScanMode::Exhaustive, ScanMode::RecencyHeuristic] {
            let temp = tempdir().expect("tempdir");
            let store = LocalStore::open(temp.path(), "site").expect("store");
            seed_local_page(&store, "PageA", "2020-01-01T00:00:00+00:00", "current");

            let mut remote = MockRemote::default();
            remote.listing.push("fresh".to_string());
            remote.pages.insert(
                "fresh".to_string(),
                PageRecord::new()
                    .with_text("fullname", "fresh")
                    .with_text("content", "fresh body"),
            );
            let mut remote = remote.with_page("PageA", "2020-01-01T00:00:00+00:00", "A body");

            let report = SyncEngine::new("site", &mut remote, store.clone(), options(scan_mode))
                .run()
                .expect("sync");

            assert_eq!(remote.fetched, vec!["fresh".to_string()], "{scan_mode}");
            assert_eq!(report.fetched, 1);
            assert_eq!(report.up_to_date, 1);
            assert_eq!(
                fs::read_to_string(store.source_path("fresh")).expect("fresh"),
                "fresh body"
            );
            assert!(store.metadata_path("fresh").is_file());
            assert_eq!(store.read_local_updated_at("fresh").expect("updated_at"), None);
            assert_eq!(report.stopped_early, scan_mode == ScanMode::RecencyHeuristic);
        }
    }

    #[test]
    fn mirrored_page_without_update_time_is_not_refetched() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        store.write_source("fresh", "fresh body").expect("source");
        store
            .write_metadata("fresh", &PageRecord::new().with_text("fullname", "fresh"))
            .expect("metadata");

        let mut remote = MockRemote::default();
        remote.listing.push("fresh".to_string());
        remote.pages.insert(
            "fresh".to_string(),
            PageRecord::new()
                .with_text("fullname", "fresh")
                .with_text("content", "fresh body"),
        );

        let report = SyncEngine::new("site", &mut remote, store, options(ScanMode::Exhaustive))
            .run()
            .expect("sync");

        assert!(remote.fetched.is_empty());
        assert_eq!(report.up_to_date, 1);
    }

    #[test]
    fn absent_content_fields_leave_local_files_untouched() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        seed_local_page(&store, "PageA", "2020-01-01T00:00:00+00:00", "old body");
        let source_before = fs::read(store.source_path("PageA")).expect("read source");

        let mut remote = MockRemote::default();
        remote.listing.push("PageA".to_string());
        remote.pages.insert(
            "PageA".to_string(),
            PageRecord::new()
                .with_text("fullname", "PageA")
                .with_text("updated_at", "2024-01-01T00:00:00+00:00"),
        );

        let report = SyncEngine::new("site", &mut remote, store.clone(), options(ScanMode::Exhaustive))
            .run()
            .expect("sync");

        assert_eq!(report.fetched, 1);
        assert_eq!(fs::read(store.source_path("PageA")).expect("source"), source_before);
        assert!(!store.markup_path("PageA").exists());
        assert_eq!(
            store.read_local_updated_at("PageA").expect("updated_at").as_deref(),
            Some("2024-01-01T00:00:00+00:00")
        );
    }

    #[test]
    fn reconcile_missing_skips_internal_pages() {
        let temp = tempdir().expect("tempdir");
        let store = LocalStore::open(temp.path(), "site").expect("store");
        let mut remote = MockRemote::default()
            .with_page("_admin", "2024-02-01T00:00:00+00:00", "secret")
            .with_page("NewPage", "2024-01-01T00:00:00+00:00", "fresh");
        let sync_options = SyncOptions {
            scan_mode: ScanMode::None,
            reconcile_missing: true,
            reconcile_deleted: false,
        };

        let report = SyncEngine::new("site", &mut remote, store.clone(), sync_options)
            .run()
            .expect("sync");

        assert_eq!(remote.fetched, vec!["NewPage".to_string()]);
        assert_eq!(report.missing_fetched, 1);
        assert!(!store.source_path("_admin").exists());
        assert!(!store.metadata_path("_admin").exists());
    }

    #[test]
    fn run_multi_reports_shared_failure_code() {
        let temp = tempdir().expect("tempdir");
        let endpoint = "https://www.wikidot.com/xml-rpc-api.php";
        let targets = vec![
            SiteTarget::new("first", "key", endpoint).expect("target"),
            SiteTarget::new("second", "key", endpoint).expect("target"),
        ];

        let report = run_multi(&targets, temp.path(), SyncOptions::default(), |_| {
            Err::<MockRemote, _>(anyhow!(MirrorError::Transport(
                "connection refused".to_string()
            )))
        });

        assert!(!report.success);
        assert!(report.sites.iter().all(|site| site.exit_code == EXIT_TRANSPORT));
        assert_eq!(report.exit_code(), EXIT_TRANSPORT);
    }

    #[test]
    fn mixed_failure_codes_report_partial_failure() {
        let outcome = |site: &str, exit_code: u8| SiteOutcome {
            site: site.to_string(),
            exit_code,
            error: Some("failed".to_string()),
            report: None,
        };
        let report = MultiSyncReport {
            success: false,
            sites: vec![outcome("first", EXIT_TRANSPORT), outcome("second", EXIT_TIMESTAMP)],
        };
        assert_eq!(report.exit_code(), EXIT_PARTIAL);

        let empty = MultiSyncReport {
            success: true,
            sites: Vec::new(),
        };
        assert_eq!(empty.exit_code(), EXIT_OK);
    }

    #[test]
    fn scan_mode_parses_cli_spellings() {
        assert_eq!("recency".parse::<ScanMode>().expect("parse"), ScanMode::RecencyHeuristic);
        assert_eq!("Exhaustive".parse::<ScanMode>().expect("parse"), ScanMode::Exhaustive);
        assert_eq!("none".parse::<ScanMode>().expect("parse"), ScanMode::None);
        assert!("sometimes".parse::<ScanMode>().is_err());
    }
}
