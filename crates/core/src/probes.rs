use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One crawled page, as reported by the external crawler or the built-in
/// backend prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub url: String,
    pub status: u16,
    #[serde(rename = "consoleErrors", default)]
    pub console_errors: Vec<String>,
    #[serde(rename = "loadMs", default)]
    pub load_ms: u64,
    #[serde(rename = "blankPage", default)]
    pub blank_page: bool,
}

impl PageResult {
    pub fn is_error(&self) -> bool {
        self.status >= 400 || self.blank_page || self.console_errors.len() > 3
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlReport {
    pub pages: Vec<PageResult>,
}

impl CrawlReport {
    pub fn error_pages(&self) -> Vec<&PageResult> {
        self.pages.iter().filter(|p| p.is_error()).collect()
    }
}

/// Result schema for an external integration prober (mail, payments,
/// storage, third-party APIs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result schema for a scripted user-journey scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// True when the host answers its health endpoint with 2xx.
pub async fn health_check(app_url: &str, timeout: Duration) -> bool {
    let client = match reqwest::Client::builder().timeout(timeout).build() {
        Ok(c) => c,
        Err(_) => return false,
    };
    let url = format!("{}/health", app_url.trim_end_matches('/'));
    match client.get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Poll the health endpoint until it answers or the deadline passes.
pub async fn poll_health(app_url: &str, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if health_check(app_url, Duration::from_secs(2)).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Backend-only crawl: plain GETs against a list of paths, no browser.
pub async fn probe_pages(app_url: &str, pages: &[String], per_page_timeout: Duration) -> CrawlReport {
    let client = reqwest::Client::builder()
        .timeout(per_page_timeout)
        .build()
        .unwrap_or_default();

    let mut report = CrawlReport::default();
    for page in pages {
        let url = if page.starts_with("http") {
            page.clone()
        } else {
            format!(
                "{}/{}",
                app_url.trim_end_matches('/'),
                page.trim_start_matches('/')
            )
        };
        let start = std::time::Instant::now();
        let result = client.get(&url).send().await;
        let load_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(resp) => {
                let status = resp.status().as_u16();
                let body = resp.text().await.unwrap_or_default();
                report.pages.push(PageResult {
                    url,
                    status,
                    console_errors: vec![],
                    load_ms,
                    blank_page: body.trim().is_empty(),
                });
            }
            Err(_) => report.pages.push(PageResult {
                url,
                status: 0,
                console_errors: vec![],
                load_ms,
                blank_page: false,
            }),
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_error_classification() {
        let ok = PageResult {
            url: "/".into(),
            status: 200,
            console_errors: vec![],
            load_ms: 10,
            blank_page: false,
        };
        assert!(!ok.is_error());

        let server_error = PageResult {
            status: 500,
            ..ok.clone()
        };
        assert!(server_error.is_error());

        let blank = PageResult {
            blank_page: true,
            ..ok.clone()
        };
        assert!(blank.is_error());

        let noisy = PageResult {
            console_errors: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            ..ok
        };
        assert!(noisy.is_error());
    }

    #[test]
    fn test_crawl_report_filters_errors() {
        let report = CrawlReport {
            pages: vec![
                PageResult {
                    url: "/".into(),
                    status: 200,
                    console_errors: vec![],
                    load_ms: 5,
                    blank_page: false,
                },
                PageResult {
                    url: "/broken".into(),
                    status: 500,
                    console_errors: vec![],
                    load_ms: 5,
                    blank_page: false,
                },
            ],
        };
        assert_eq!(report.error_pages().len(), 1);
    }
}
