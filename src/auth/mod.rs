//! Login: credentials, selector chains and form login.
//!
//! Login-field discovery is an ordered [`SelectorChain`]; the first selector
//! that matches an element wins. [`FormLogin`] fills and submits the platform
//! login form through the page capability and accepts an attribute-release
//! consent page when an SSO provider shows one.

mod cookies;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument};
use url::Url;

use crate::page::{Element, Page, PageError, WaitUntil};

pub use cookies::{
    CookieError, SessionCookie, cookie_jar_from, load_cookie_file, parse_cookie_lines,
};

/// Environment variable holding the username.
pub const USERNAME_ENV: &str = "HARVESTER_USERNAME";
/// Environment variable holding the password.
pub const PASSWORD_ENV: &str = "HARVESTER_PASSWORD";

/// Errors raised while logging in.
#[derive(Debug, Error)]
pub enum AuthError {
    /// A credential variable is unset or empty.
    #[error("missing credentials: set {variable}")]
    MissingCredentials {
        /// The missing variable.
        variable: &'static str,
    },

    /// No selector of a chain matched on the login page.
    #[error("login form field '{field}' not found on {url}")]
    FieldNotFound {
        /// Which field.
        field: &'static str,
        /// Page URL.
        url: String,
    },

    /// The page capability failed during a login step.
    #[error("login step '{step}' failed: {source}")]
    Page {
        /// Which step.
        step: &'static str,
        /// Underlying error.
        #[source]
        source: PageError,
    },
}

impl AuthError {
    fn page(step: &'static str, source: PageError) -> Self {
        Self::Page { step, source }
    }
}

/// Username and password. The password never appears in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    /// Creates credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Reads [`USERNAME_ENV`] and [`PASSWORD_ENV`].
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCredentials`] if either is unset or empty.
    pub fn from_env() -> Result<Self, AuthError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AuthError> {
        let read = |variable: &'static str| {
            lookup(variable)
                .filter(|v| !v.is_empty())
                .ok_or(AuthError::MissingCredentials { variable })
        };
        Ok(Self::new(read(USERNAME_ENV)?, read(PASSWORD_ENV)?))
    }

    /// The username.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The password. Never log it.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Ordered list of selectors; the first that matches wins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectorChain {
    selectors: Vec<String>,
}

impl SelectorChain {
    /// Creates a chain tried in the given order.
    pub fn new<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selectors: selectors.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the chain has no selectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    /// First selector with a match, and the matched element.
    ///
    /// Selectors the page cannot parse are skipped.
    ///
    /// # Errors
    ///
    /// Propagates any other [`PageError`].
    pub async fn first_match(
        &self,
        page: &dyn Page,
    ) -> Result<Option<(String, Element)>, PageError> {
        for selector in &self.selectors {
            match page.query(selector).await {
                Ok(Some(element)) => return Ok(Some((selector.clone(), element))),
                Ok(None) => {}
                Err(PageError::InvalidSelector { .. }) => {
                    debug!(%selector, "skipping unparseable selector");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

/// Something that can turn the session into a logged-in one.
#[async_trait]
pub trait LoginCapability: Send + Sync {
    /// Performs one login attempt on `page`.
    async fn login(&self, page: &mut dyn Page) -> Result<(), AuthError>;
}

/// Fills and submits the platform's login form.
#[derive(Debug, Clone)]
pub struct FormLogin {
    login_url: Url,
    credentials: Credentials,
    username: SelectorChain,
    password: SelectorChain,
    submit: SelectorChain,
    consent: SelectorChain,
    timeout: Duration,
}

impl FormLogin {
    /// Creates a form login for `login_url`.
    #[must_use]
    pub fn new(login_url: Url, credentials: Credentials, timeout: Duration) -> Self {
        Self {
            login_url,
            credentials,
            username: SelectorChain::default(),
            password: SelectorChain::default(),
            submit: SelectorChain::default(),
            consent: SelectorChain::default(),
            timeout,
        }
    }

    /// Sets the field selector chains.
    #[must_use]
    pub fn with_fields(
        mut self,
        username: SelectorChain,
        password: SelectorChain,
        submit: SelectorChain,
    ) -> Self {
        self.username = username;
        self.password = password;
        self.submit = submit;
        self
    }

    /// Sets the consent buttons accepted after submitting.
    #[must_use]
    pub fn with_consent(mut self, consent: SelectorChain) -> Self {
        self.consent = consent;
        self
    }

    async fn required(
        &self,
        page: &dyn Page,
        chain: &SelectorChain,
        field: &'static str,
    ) -> Result<String, AuthError> {
        let found = chain
            .first_match(page)
            .await
            .map_err(|e| AuthError::page("locate field", e))?;
        match found {
            Some((selector, _)) => Ok(selector),
            None => Err(AuthError::FieldNotFound {
                field,
                url: page
                    .current_url()
                    .map_or_else(|| self.login_url.to_string(), |u| u.to_string()),
            }),
        }
    }
}

#[async_trait]
impl LoginCapability for FormLogin {
    #[instrument(level = "debug", skip(self, page), fields(url = %self.login_url))]
    async fn login(&self, page: &mut dyn Page) -> Result<(), AuthError> {
        page.goto(&self.login_url, WaitUntil::Load, self.timeout)
            .await
            .map_err(|e| AuthError::page("open login page", e))?;

        let user_field = self.required(page, &self.username, "username").await?;
        let pass_field = self.required(page, &self.password, "password").await?;
        let submit = self.required(page, &self.submit, "submit").await?;

        page.fill(&user_field, self.credentials.username())
            .await
            .map_err(|e| AuthError::page("fill username", e))?;
        page.fill(&pass_field, self.credentials.password())
            .await
            .map_err(|e| AuthError::page("fill password", e))?;
        page.click(&submit)
            .await
            .map_err(|e| AuthError::page("submit", e))?;
        page.wait_for_load(WaitUntil::NetworkIdle, self.timeout)
            .await
            .map_err(|e| AuthError::page("wait after submit", e))?;

        if let Some((selector, _)) = self
            .consent
            .first_match(page)
            .await
            .map_err(|e| AuthError::page("look for consent", e))?
        {
            info!("accepting information release");
            page.click(&selector)
                .await
                .map_err(|e| AuthError::page("accept consent", e))?;
        }

        debug!(url = ?page.current_url().map(|u| u.to_string()), "login form submitted");
        Ok(())
    }
}
