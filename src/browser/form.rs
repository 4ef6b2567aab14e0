use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use thirtyfour::prelude::*;
use tracing::{debug, warn};

use crate::browser::session::BrowserSession;
use crate::cli::config::{BrowserSettings, ElementIds, PortalSettings};
use crate::crawler::task::Location;
use crate::error::PortalError;
use crate::extract::{extract_owners, OwnerRow, PageSignal, PhraseSet};
use crate::extract::signals::{form_present, select_options};

/// The cascading land-records form, one level per call.
///
/// Each selection returns the option labels of the next level; an empty list
/// means the portal has no data below this point.
#[async_trait]
pub trait FormPortal: Send {
    /// Start the browser and load the form
    async fn open(&mut self) -> Result<(), PortalError>;

    async fn close(&mut self);

    /// Drop cookies and reload the form without restarting the browser
    async fn reset_session(&mut self) -> Result<(), PortalError>;

    async fn select_location(&mut self, location: &Location) -> Result<(), PortalError>;

    /// Enter a survey number and submit; returns the surnoc options
    async fn submit_survey(&mut self, survey_no: u32) -> Result<Vec<String>, PortalError>;

    /// Returns the hissa options
    async fn select_surnoc(&mut self, surnoc: &str) -> Result<Vec<String>, PortalError>;

    /// Returns the period options
    async fn select_hissa(&mut self, hissa: &str) -> Result<Vec<String>, PortalError>;

    /// Select the period, submit "fetch details" and extract the owner table
    async fn fetch_details(&mut self, period: &str) -> Result<Vec<OwnerRow>, PortalError>;
}

/// Location levels currently selected in the browser
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NavState {
    levels: [Option<String>; 4],
}

impl NavState {
    pub fn is_selected(&self, level: usize, value: &str) -> bool {
        self.levels[level].as_deref() == Some(value)
    }

    /// Record a selection; every level below it is reloaded by the portal
    pub fn select(&mut self, level: usize, value: &str) {
        self.levels[level] = Some(value.to_string());
        for lower in self.levels.iter_mut().skip(level + 1) {
            *lower = None;
        }
    }

    pub fn clear(&mut self) {
        self.levels = Default::default();
    }
}

const SELECT_BY_LABEL: &str = r#"
const select = document.getElementById(arguments[0]);
if (!select) { return false; }
const option = Array.from(select.options).find(o => o.text.trim() === arguments[1]);
if (!option) { return false; }
select.value = option.value;
select.dispatchEvent(new Event('change', { bubbles: true }));
return true;
"#;

/// `FormPortal` driving the real portal through chromedriver
pub struct WebFormPortal {
    worker_id: u32,
    browser: BrowserSettings,
    portal: PortalSettings,
    phrases: PhraseSet,
    session: Option<BrowserSession>,
    nav: NavState,
}

impl WebFormPortal {
    pub fn new(worker_id: u32, browser: BrowserSettings, portal: PortalSettings) -> Self {
        let phrases = PhraseSet::from_settings(&portal);
        Self {
            worker_id,
            browser,
            portal,
            phrases,
            session: None,
            nav: NavState::default(),
        }
    }

    fn ids(&self) -> &ElementIds {
        &self.portal.element_ids
    }

    fn driver(&self) -> Result<&WebDriver, PortalError> {
        match &self.session {
            Some(session) => session.driver(),
            None => Err(PortalError::BrowserDead("no browser session".into())),
        }
    }

    async fn load_form(&mut self) -> Result<(), PortalError> {
        self.nav.clear();
        let base_url = self.portal.base_url.clone();
        self.driver()?.goto(&base_url).await?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.browser.element_wait_secs);
        loop {
            let html = self.page_source().await?;
            self.phrases.classify_markup(&html).into_result()?;
            if form_present(&html, self.ids()) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PortalError::Timeout("form controls did not appear".into()));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn page_source(&self) -> Result<String, PortalError> {
        Ok(self.driver()?.source().await?)
    }

    /// Accept a pending JavaScript alert and classify its text
    async fn handle_alert(&self) -> Result<(), PortalError> {
        let driver = self.driver()?;
        let Ok(text) = driver.get_alert_text().await else {
            return Ok(());
        };

        if let Err(e) = driver.accept_alert().await {
            debug!("Failed to accept alert: {}", e);
        }

        match self.phrases.classify(&text) {
            PageSignal::Clear => {
                warn!("Alert: {}", text.chars().take(100).collect::<String>());
                Ok(())
            }
            signal => signal.into_result(),
        }
    }

    /// Wait for a postback, then check alerts and page content for failure signals
    async fn settle(&self, wait_ms: u64) -> Result<String, PortalError> {
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
        self.handle_alert().await?;
        let html = self.page_source().await?;
        self.phrases.classify_markup(&html).into_result()?;
        Ok(html)
    }

    async fn select_label(&self, select_id: &str, label: &str) -> Result<String, PortalError> {
        let selected = self
            .driver()?
            .execute(SELECT_BY_LABEL, vec![json!(select_id), json!(label)])
            .await?
            .convert::<bool>()?;

        if !selected {
            return Err(PortalError::MissingOption(format!("'{}' in {}", label, select_id)));
        }
        self.settle(self.browser.post_select_wait_ms).await
    }

    async fn click(&self, element_id: &str) -> Result<String, PortalError> {
        self.driver()?.find(By::Id(element_id)).await?.click().await?;
        self.settle(self.browser.post_click_wait_ms).await
    }
}

#[async_trait]
impl FormPortal for WebFormPortal {
    async fn open(&mut self) -> Result<(), PortalError> {
        if self.session.is_none() {
            let session = BrowserSession::launch(&self.browser, self.worker_id)
                .await
                .map_err(|e| PortalError::BrowserDead(format!("{:#}", e)))?;
            self.session = Some(session);
        }
        self.load_form().await
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.nav.clear();
    }

    async fn reset_session(&mut self) -> Result<(), PortalError> {
        debug!("Resetting portal session");
        self.driver()?.delete_all_cookies().await?;
        self.load_form().await
    }

    async fn select_location(&mut self, location: &Location) -> Result<(), PortalError> {
        let ids = self.ids().clone();
        let levels = [
            (ids.district.as_str(), location.district_name.as_str()),
            (ids.taluk.as_str(), location.taluk_name.as_str()),
            (ids.hobli.as_str(), location.hobli_name.as_str()),
            (ids.village.as_str(), location.village_name.as_str()),
        ];

        for (level, (select_id, label)) in levels.into_iter().enumerate() {
            if self.nav.is_selected(level, label) {
                continue;
            }
            self.select_label(select_id, label).await?;
            self.nav.select(level, label);
        }
        Ok(())
    }

    async fn submit_survey(&mut self, survey_no: u32) -> Result<Vec<String>, PortalError> {
        let ids = self.ids().clone();
        let input = self.driver()?.find(By::Id(&ids.survey_no)).await?;
        input.clear().await?;
        input.send_keys(survey_no.to_string()).await?;

        let html = self.click(&ids.go_button).await?;
        Ok(select_options(&html, &ids.surnoc))
    }

    async fn select_surnoc(&mut self, surnoc: &str) -> Result<Vec<String>, PortalError> {
        let ids = self.ids().clone();
        let html = self.select_label(&ids.surnoc, surnoc).await?;
        Ok(select_options(&html, &ids.hissa))
    }

    async fn select_hissa(&mut self, hissa: &str) -> Result<Vec<String>, PortalError> {
        let ids = self.ids().clone();
        let html = self.select_label(&ids.hissa, hissa).await?;
        Ok(select_options(&html, &ids.period))
    }

    async fn fetch_details(&mut self, period: &str) -> Result<Vec<OwnerRow>, PortalError> {
        let ids = self.ids().clone();
        self.select_label(&ids.period, period).await?;
        let html = self.click(&ids.fetch_button).await?;
        Ok(extract_owners(&html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_invalidates_lower_levels() {
        let mut nav = NavState::default();
        nav.select(0, "Mysuru");
        nav.select(1, "Hunsur");
        nav.select(2, "Bilikere");
        nav.select(3, "Hebbal");
        assert!(nav.is_selected(3, "Hebbal"));

        nav.select(1, "Nanjangud");
        assert!(nav.is_selected(0, "Mysuru"));
        assert!(nav.is_selected(1, "Nanjangud"));
        assert!(!nav.is_selected(2, "Bilikere"));
        assert!(!nav.is_selected(3, "Hebbal"));

        nav.clear();
        assert_eq!(nav, NavState::default());
    }

    #[tokio::test]
    async fn test_calls_without_browser_report_dead_browser() {
        let config = crate::cli::config::HarvestConfig::default();
        let mut portal = WebFormPortal::new(0, config.browser, config.portal);
        assert!(matches!(portal.submit_survey(1).await, Err(PortalError::BrowserDead(_))));
        assert!(matches!(portal.reset_session().await, Err(PortalError::BrowserDead(_))));
    }
}
