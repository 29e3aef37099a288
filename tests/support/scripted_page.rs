//! In-memory `Page` driven by canned documents, for driver tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvester_core::page::{
    Element, FileTransfer, Page, PageError, PageResponse, WaitUntil, resolve_href,
};
use scraper::{Html, Selector};
use url::Url;

/// Login behaviour: navigating to a protected URL while logged out lands on
/// `login_url`; clicking `submit` with the right password logs in.
#[derive(Debug, Clone)]
pub struct ScriptedLogin {
    pub login_url: Url,
    pub password: String,
    pub submit: String,
}

#[derive(Debug, Default)]
pub struct ScriptedPage {
    documents: HashMap<String, String>,
    statuses: HashMap<String, u16>,
    files: HashMap<String, (String, Vec<u8>)>,
    login: Option<ScriptedLogin>,
    logged_in: bool,
    filled: Vec<(String, String)>,
    current: Option<Url>,
    pub visits: Arc<Mutex<Vec<String>>>,
    pub closes: Arc<AtomicUsize>,
    pub requests: Arc<AtomicUsize>,
    pub login_attempts: Arc<AtomicUsize>,
}

impl ScriptedPage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `html` at `url`.
    pub fn document(mut self, url: &str, html: &str) -> Self {
        self.documents.insert(url.to_string(), html.to_string());
        self
    }

    /// Fails navigations and requests to `url` with `status`.
    pub fn status(mut self, url: &str, status: u16) -> Self {
        self.statuses.insert(url.to_string(), status);
        self
    }

    /// Serves a file at `url` to requests and clicks.
    pub fn file(mut self, url: &str, content_type: &str, body: &[u8]) -> Self {
        self.files
            .insert(url.to_string(), (content_type.to_string(), body.to_vec()));
        self
    }

    pub fn requires_login(mut self, login: ScriptedLogin) -> Self {
        self.login = Some(login);
        self
    }

    pub fn visited(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }

    fn ensure_current(&self) -> Result<&Url, PageError> {
        self.current.as_ref().ok_or(PageError::NotLoaded)
    }

    fn html(&self) -> Result<&str, PageError> {
        let url = self.ensure_current()?;
        Ok(self
            .documents
            .get(url.as_str())
            .map_or("", String::as_str))
    }

    fn select(&self, selector: &str) -> Result<Vec<Element>, PageError> {
        let parsed =
            Selector::parse(selector).map_err(|_| PageError::invalid_selector(selector))?;
        let document = Html::parse_document(self.html()?);
        Ok(document
            .select(&parsed)
            .enumerate()
            .map(|(index, el)| Element {
                selector: selector.to_string(),
                index,
                tag: el.value().name().to_string(),
                text: el.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" "),
                attributes: el
                    .value()
                    .attrs()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            })
            .collect())
    }

    fn response(&self, url: &Url) -> Result<PageResponse, PageError> {
        if let Some(status) = self.statuses.get(url.as_str()) {
            return Ok(PageResponse {
                url: url.clone(),
                status: *status,
                headers: BTreeMap::new(),
                body: Vec::new(),
            });
        }
        if let Some((content_type, body)) = self.files.get(url.as_str()) {
            return Ok(PageResponse {
                url: url.clone(),
                status: 200,
                headers: BTreeMap::from([("content-type".to_string(), content_type.clone())]),
                body: body.clone(),
            });
        }
        match self.documents.get(url.as_str()) {
            Some(html) => Ok(PageResponse {
                url: url.clone(),
                status: 200,
                headers: BTreeMap::from([(
                    "content-type".to_string(),
                    "text/html; charset=utf-8".to_string(),
                )]),
                body: html.as_bytes().to_vec(),
            }),
            None => Ok(PageResponse {
                url: url.clone(),
                status: 404,
                headers: BTreeMap::new(),
                body: Vec::new(),
            }),
        }
    }
}

#[async_trait]
impl Page for ScriptedPage {
    fn current_url(&self) -> Option<Url> {
        self.current.clone()
    }

    async fn title(&self) -> Result<String, PageError> {
        Ok(self
            .select("title")?
            .into_iter()
            .next()
            .map(|el| el.text)
            .unwrap_or_default())
    }

    async fn content(&self) -> Result<String, PageError> {
        Ok(self.html()?.to_string())
    }

    async fn query(&self, selector: &str) -> Result<Option<Element>, PageError> {
        Ok(self.select(selector)?.into_iter().next())
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Element>, PageError> {
        self.select(selector)
    }

    async fn evaluate(
        &self,
        _script: &str,
        _element: Option<&Element>,
    ) -> Result<serde_json::Value, PageError> {
        Err(PageError::unsupported("evaluate"))
    }

    async fn goto(
        &mut self,
        url: &Url,
        _wait: WaitUntil,
        _timeout: Duration,
    ) -> Result<PageResponse, PageError> {
        self.visits.lock().unwrap().push(url.to_string());
        let target = match &self.login {
            Some(login) if !self.logged_in && *url != login.login_url => login.login_url.clone(),
            _ => url.clone(),
        };
        let response = self.response(&target)?;
        if !response.is_success() {
            return Err(PageError::http_status(target.as_str(), response.status));
        }
        self.current = Some(target);
        self.filled.clear();
        Ok(response)
    }

    async fn wait_for_load(&mut self, _wait: WaitUntil, _timeout: Duration) -> Result<(), PageError> {
        self.ensure_current().map(|_| ())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), PageError> {
        if self.select(selector)?.is_empty() {
            return Err(PageError::element_not_found(selector));
        }
        self.filled.push((selector.to_string(), value.to_string()));
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<(), PageError> {
        if self.select(selector)?.is_empty() {
            return Err(PageError::element_not_found(selector));
        }
        if let Some(login) = &self.login
            && selector == login.submit
        {
            self.login_attempts.fetch_add(1, Ordering::SeqCst);
            if self.filled.iter().any(|(_, v)| *v == login.password) {
                self.logged_in = true;
            }
        }
        Ok(())
    }

    async fn click_for_download(
        &mut self,
        element: &Element,
        _timeout: Duration,
    ) -> Result<FileTransfer, PageError> {
        let base = self.ensure_current()?.clone();
        let target = element
            .href()
            .and_then(|href| resolve_href(&base, href))
            .ok_or_else(|| PageError::no_transfer("element has no link target"))?;
        let response = self.response(&target)?;
        if !response.is_success() {
            return Err(PageError::http_status(target.as_str(), response.status));
        }
        if response.content_type().is_some_and(|ct| ct.contains("html")) {
            return Err(PageError::no_transfer(format!("{target} is a page")));
        }
        Ok(FileTransfer {
            suggested_filename: None,
            content_type: response.content_type().map(str::to_string),
            url: target,
            body: response.body,
        })
    }

    async fn request(&self, url: &Url, _timeout: Duration) -> Result<PageResponse, PageError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.response(url)
    }

    async fn close(&mut self) -> Result<(), PageError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.current = None;
        Ok(())
    }
}
