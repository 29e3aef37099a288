//! HTTP-backed [`Page`]: a reqwest session with a cookie jar plus scraper for
//! DOM queries.
//!
//! Forms are submitted the way a browser would on click: the enclosing form's
//! fields are collected, overlaid with values set through [`Page::fill`], and
//! sent to the form action. Scripts are not executed, so [`Page::evaluate`]
//! is unsupported.
//!
//! Navigation follows redirects anywhere, as login flows hop through identity
//! providers. File fetches ([`Page::request`], [`Page::click_for_download`])
//! use a second client over the same cookie jar whose redirects stop at hosts
//! outside the trusted list; the 3xx response is returned instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use super::{Element, FileTransfer, Page, PageError, PageResponse, WaitUntil, resolve_href};
use crate::download::constants::{CONNECT_TIMEOUT_SECS, NAVIGATION_TIMEOUT};
use crate::download::filename::parse_content_disposition;
use crate::filter::HostAllowList;
use crate::user_agent;

/// Redirect hops a file fetch follows before giving up.
const MAX_TRANSFER_REDIRECTS: usize = 10;

#[derive(Debug, Clone)]
struct Document {
    url: Url,
    html: String,
}

/// Page session over plain HTTP.
#[derive(Debug)]
pub struct HttpPage {
    client: Client,
    transfer_client: Client,
    cookie_jar: Arc<Jar>,
    connect_timeout: Duration,
    document: Option<Document>,
    filled: Vec<(String, String)>,
    action_timeout: Duration,
    closed: bool,
}

impl HttpPage {
    /// Creates a session with an empty cookie jar.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Client`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, PageError> {
        Self::with_cookie_jar(Arc::new(Jar::default()), Duration::from_secs(CONNECT_TIMEOUT_SECS))
    }

    /// Creates a session sharing `cookie_jar`.
    ///
    /// Until [`HttpPage::with_trusted_hosts`] is called, file fetches follow
    /// redirects only on the host they started from.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Client`] if the HTTP client cannot be built.
    #[instrument(level = "debug", skip(cookie_jar))]
    pub fn with_cookie_jar(
        cookie_jar: Arc<Jar>,
        connect_timeout: Duration,
    ) -> Result<Self, PageError> {
        let client = build_client(&cookie_jar, connect_timeout, Policy::default())?;
        let transfer_client =
            build_client(&cookie_jar, connect_timeout, transfer_redirects(None))?;
        Ok(Self {
            client,
            transfer_client,
            cookie_jar,
            connect_timeout,
            document: None,
            filled: Vec::new(),
            action_timeout: NAVIGATION_TIMEOUT,
            closed: false,
        })
    }

    /// Restricts redirects of file fetches to `hosts`.
    ///
    /// # Errors
    ///
    /// Returns [`PageError::Client`] if the HTTP client cannot be built.
    pub fn with_trusted_hosts(mut self, hosts: HostAllowList) -> Result<Self, PageError> {
        self.transfer_client = build_client(
            &self.cookie_jar,
            self.connect_timeout,
            transfer_redirects(Some(hosts)),
        )?;
        Ok(self)
    }

    /// Sets the bound on navigations triggered by [`Page::click`].
    #[must_use]
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    fn ensure_open(&self) -> Result<(), PageError> {
        if self.closed {
            Err(PageError::Closed)
        } else {
            Ok(())
        }
    }

    fn document(&self) -> Result<&Document, PageError> {
        self.ensure_open()?;
        self.document.as_ref().ok_or(PageError::NotLoaded)
    }

    async fn fetch(
        &self,
        request: RequestBuilder,
        url: &Url,
        operation: &'static str,
        timeout: Duration,
    ) -> Result<PageResponse, PageError> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_client_error(operation, url, e))?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| map_client_error(operation, url, e))?
            .to_vec();

        Ok(PageResponse {
            url: final_url,
            status,
            headers,
            body,
        })
    }

    /// Sends `request` and makes the response the current document.
    async fn load(
        &mut self,
        request: RequestBuilder,
        url: &Url,
        timeout: Duration,
    ) -> Result<PageResponse, PageError> {
        let response = self.fetch(request, url, "navigation", timeout).await?;
        if !response.is_success() {
            return Err(PageError::http_status(url.as_str(), response.status));
        }

        let html = if is_html(response.content_type()) {
            String::from_utf8_lossy(&response.body).into_owned()
        } else {
            debug!(url = %response.url, "navigation landed on a non-HTML resource");
            String::new()
        };
        self.document = Some(Document {
            url: response.url.clone(),
            html,
        });
        self.filled.clear();
        Ok(response)
    }
}

#[async_trait]
impl Page for HttpPage {
    fn current_url(&self) -> Option<Url> {
        self.document.as_ref().map(|doc| doc.url.clone())
    }

    async fn title(&self) -> Result<String, PageError> {
        let doc = self.document()?;
        Ok(document_title(&doc.html))
    }

    async fn content(&self) -> Result<String, PageError> {
        Ok(self.document()?.html.clone())
    }

    async fn query(&self, selector: &str) -> Result<Option<Element>, PageError> {
        let doc = self.document()?;
        Ok(select_elements(&doc.html, selector)?.into_iter().next())
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Element>, PageError> {
        let doc = self.document()?;
        select_elements(&doc.html, selector)
    }

    async fn evaluate(
        &self,
        _script: &str,
        _element: Option<&Element>,
    ) -> Result<serde_json::Value, PageError> {
        Err(PageError::unsupported("evaluate"))
    }

    #[instrument(level = "debug", skip(self, url), fields(url = %url))]
    async fn goto(
        &mut self,
        url: &Url,
        wait: WaitUntil,
        timeout: Duration,
    ) -> Result<PageResponse, PageError> {
        self.ensure_open()?;
        // The body is fully read before returning, which covers every load state.
        debug!(?wait, "navigating");
        let request = self.client.get(url.clone());
        self.load(request, url, timeout).await
    }

    async fn wait_for_load(
        &mut self,
        _wait: WaitUntil,
        _timeout: Duration,
    ) -> Result<(), PageError> {
        self.document().map(|_| ())
    }

    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), PageError> {
        let name = field_name(&self.document()?.html, selector)?;
        if let Some(entry) = self.filled.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value.to_string();
        } else {
            self.filled.push((name, value.to_string()));
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn click(&mut self, selector: &str) -> Result<(), PageError> {
        let plan = {
            let doc = self.document()?;
            plan_click(&doc.html, &doc.url, selector, &self.filled)?
        };

        let timeout = self.action_timeout;
        match plan {
            ClickPlan::Follow(target) => {
                let request = self.client.get(target.clone());
                self.load(request, &target, timeout).await?;
            }
            ClickPlan::Submit(form) => {
                debug!(action = %form.action, post = form.post, fields = form.fields.len(), "submitting form");
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(form.fields.iter())
                    .finish();
                let (request, target) = if form.post {
                    let request = self
                        .client
                        .post(form.action.clone())
                        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                        .body(encoded);
                    (request, form.action)
                } else {
                    let mut target = form.action;
                    target.set_query(Some(&encoded));
                    (self.client.get(target.clone()), target)
                };
                self.load(request, &target, timeout).await?;
            }
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self, element), fields(selector = %element.selector))]
    async fn click_for_download(
        &mut self,
        element: &Element,
        timeout: Duration,
    ) -> Result<FileTransfer, PageError> {
        let base = self.document()?.url.clone();
        let target = element
            .href()
            .or_else(|| element.attr("src"))
            .and_then(|href| resolve_href(&base, href))
            .ok_or_else(|| PageError::no_transfer("element has no link target"))?;

        let request = self.transfer_client.get(target.clone());
        let response = self.fetch(request, &target, "download", timeout).await?;
        if !response.is_success() {
            return Err(PageError::http_status(target.as_str(), response.status));
        }
        if response.is_html_page() {
            return Err(PageError::no_transfer(format!(
                "{target} opened a page instead of a file"
            )));
        }

        Ok(FileTransfer {
            suggested_filename: response
                .header("content-disposition")
                .and_then(parse_content_disposition),
            content_type: response.content_type().map(str::to_string),
            url: response.url,
            body: response.body,
        })
    }

    async fn request(&self, url: &Url, timeout: Duration) -> Result<PageResponse, PageError> {
        self.ensure_open()?;
        let request = self.transfer_client.get(url.clone());
        self.fetch(request, url, "request", timeout).await
    }

    async fn close(&mut self) -> Result<(), PageError> {
        if self.closed {
            debug!("page already closed");
            return Ok(());
        }
        self.closed = true;
        self.document = None;
        self.filled.clear();
        debug!("page closed");
        Ok(())
    }
}

fn build_client(
    cookie_jar: &Arc<Jar>,
    connect_timeout: Duration,
    redirects: Policy,
) -> Result<Client, PageError> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .gzip(true)
        .user_agent(user_agent::default_session_user_agent())
        .cookie_provider(Arc::clone(cookie_jar))
        .redirect(redirects)
        .build()
        .map_err(|source| PageError::Client { source })
}

/// Redirect policy for file fetches: follow hops to trusted hosts, or to the
/// starting host when no list is set, and stop anywhere else.
fn transfer_redirects(trusted: Option<HostAllowList>) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_TRANSFER_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let allowed = match &trusted {
            Some(hosts) => hosts.is_allowed(attempt.url()),
            None => attempt
                .previous()
                .first()
                .is_some_and(|origin| same_host(origin, attempt.url())),
        };
        if allowed {
            attempt.follow()
        } else {
            debug!(location = %attempt.url(), "not following redirect to untrusted host");
            attempt.stop()
        }
    })
}

fn same_host(a: &Url, b: &Url) -> bool {
    a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

fn map_client_error(operation: &'static str, url: &Url, error: reqwest::Error) -> PageError {
    if error.is_timeout() {
        PageError::timeout(operation, url.as_str())
    } else {
        PageError::network(url.as_str(), error)
    }
}

fn is_html(content_type: Option<&str>) -> bool {
    content_type.is_none_or(|ct| {
        let ct = ct.to_ascii_lowercase();
        ct.contains("text/html") || ct.contains("application/xhtml")
    })
}

fn parse_selector(selector: &str) -> Result<Selector, PageError> {
    Selector::parse(selector).map_err(|_| PageError::invalid_selector(selector))
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn snapshot(selector: &str, index: usize, element: ElementRef<'_>) -> Element {
    Element {
        selector: selector.to_string(),
        index,
        tag: element.value().name().to_ascii_lowercase(),
        text: normalize_whitespace(&element.text().collect::<Vec<_>>().join(" ")),
        attributes: element
            .value()
            .attrs()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
    }
}

fn select_elements(html: &str, selector: &str) -> Result<Vec<Element>, PageError> {
    let parsed = parse_selector(selector)?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&parsed)
        .enumerate()
        .map(|(index, element)| snapshot(selector, index, element))
        .collect())
}

fn document_title(html: &str) -> String {
    let document = Html::parse_document(html);
    Selector::parse("title")
        .ok()
        .and_then(|sel| {
            document
                .select(&sel)
                .next()
                .map(|el| normalize_whitespace(&el.text().collect::<String>()))
        })
        .unwrap_or_default()
}

fn field_name(html: &str, selector: &str) -> Result<String, PageError> {
    let parsed = parse_selector(selector)?;
    let document = Html::parse_document(html);
    let element = document
        .select(&parsed)
        .next()
        .ok_or_else(|| PageError::element_not_found(selector))?;
    element
        .value()
        .attr("name")
        .map(str::to_string)
        .ok_or_else(|| PageError::form(format!("field {selector} has no name attribute")))
}

#[derive(Debug, PartialEq, Eq)]
struct FormSubmission {
    action: Url,
    post: bool,
    fields: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq)]
enum ClickPlan {
    Follow(Url),
    Submit(FormSubmission),
}

fn is_submit_control(element: &ElementRef<'_>) -> bool {
    let value = element.value();
    match value.name() {
        "button" => value
            .attr("type")
            .is_none_or(|t| t.eq_ignore_ascii_case("submit")),
        "input" => value
            .attr("type")
            .is_some_and(|t| t.eq_ignore_ascii_case("submit") || t.eq_ignore_ascii_case("image")),
        _ => false,
    }
}

fn plan_click(
    html: &str,
    base: &Url,
    selector: &str,
    filled: &[(String, String)],
) -> Result<ClickPlan, PageError> {
    let parsed = parse_selector(selector)?;
    let document = Html::parse_document(html);
    let element = document
        .select(&parsed)
        .next()
        .ok_or_else(|| PageError::element_not_found(selector))?;

    if element.value().name() == "a" {
        let href = element
            .value()
            .attr("href")
            .ok_or_else(|| PageError::form(format!("link {selector} has no href")))?;
        let target = resolve_href(base, href).ok_or_else(|| PageError::invalid_url(href))?;
        return Ok(ClickPlan::Follow(target));
    }

    let form = element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|ancestor| ancestor.value().name() == "form")
        .ok_or_else(|| PageError::form(format!("{selector} is not inside a form")))?;

    let mut fields = form_fields(&form)?;
    for (name, value) in filled {
        if let Some(entry) = fields.iter_mut().find(|(n, _)| n == name) {
            entry.1.clone_from(value);
        } else {
            fields.push((name.clone(), value.clone()));
        }
    }
    if is_submit_control(&element)
        && let Some(name) = element.value().attr("name")
    {
        let value = element.value().attr("value").unwrap_or_default();
        fields.push((name.to_string(), value.to_string()));
    }

    let action = match form.value().attr("action").map(str::trim) {
        Some(action) if !action.is_empty() => {
            base.join(action).map_err(|_| PageError::invalid_url(action))?
        }
        _ => base.clone(),
    };
    let post = form
        .value()
        .attr("method")
        .is_some_and(|m| m.eq_ignore_ascii_case("post"));

    Ok(ClickPlan::Submit(FormSubmission {
        action,
        post,
        fields,
    }))
}

fn form_fields(form: &ElementRef<'_>) -> Result<Vec<(String, String)>, PageError> {
    let controls = parse_selector("input, textarea, select")?;
    let options = parse_selector("option")?;
    let mut fields = Vec::new();

    for control in form.select(&controls) {
        let value = control.value();
        let Some(name) = value.attr("name") else {
            continue;
        };
        if value.attr("disabled").is_some() {
            continue;
        }
        let field_value = match value.name() {
            "textarea" => control.text().collect::<String>(),
            "select" => {
                let selected = control
                    .select(&options)
                    .find(|o| o.value().attr("selected").is_some())
                    .or_else(|| control.select(&options).next());
                match selected {
                    Some(option) => option
                        .value()
                        .attr("value")
                        .map_or_else(|| option.text().collect::<String>(), str::to_string),
                    None => continue,
                }
            }
            _ => {
                let kind = value.attr("type").unwrap_or("text").to_ascii_lowercase();
                match kind.as_str() {
                    "submit" | "button" | "image" | "reset" | "file" => continue,
                    "checkbox" | "radio" => {
                        if value.attr("checked").is_none() {
                            continue;
                        }
                        value.attr("value").unwrap_or("on").to_string()
                    }
                    _ => value.attr("value").unwrap_or_default().to_string(),
                }
            }
        };
        fields.push((name.to_string(), field_value));
    }
    Ok(fields)
}
