use scraper::{Html, Selector};

use crate::cli::config::{ElementIds, PortalSettings};
use crate::error::PortalError;
use super::visible_text;

/// What the page (or an alert) is telling us about the portal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSignal {
    SessionExpired(String),
    PortalIssue(String),
    Clear,
}

impl PageSignal {
    /// Turn a failure signal into the matching error
    pub fn into_result(self) -> Result<(), PortalError> {
        match self {
            PageSignal::SessionExpired(phrase) => Err(PortalError::SessionExpired(phrase)),
            PageSignal::PortalIssue(phrase) => Err(PortalError::PortalIssue(phrase)),
            PageSignal::Clear => Ok(()),
        }
    }
}

/// Lower-cased phrase lists used to classify page content and alert text
#[derive(Debug, Clone)]
pub struct PhraseSet {
    session: Vec<String>,
    issues: Vec<String>,
}

impl PhraseSet {
    pub fn new(session: &[String], issues: &[String]) -> Self {
        Self {
            session: session.iter().map(|p| p.to_lowercase()).collect(),
            issues: issues.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    pub fn from_settings(settings: &PortalSettings) -> Self {
        Self::new(&settings.session_phrases, &settings.portal_issue_phrases)
    }

    /// Classify free text (alert text, visible page text)
    pub fn classify(&self, text: &str) -> PageSignal {
        let lower = text.to_lowercase();

        if let Some(phrase) = self.session.iter().find(|p| lower.contains(p.as_str())) {
            return PageSignal::SessionExpired(phrase.clone());
        }
        if let Some(phrase) = self.issues.iter().find(|p| lower.contains(p.as_str())) {
            return PageSignal::PortalIssue(phrase.clone());
        }
        PageSignal::Clear
    }

    /// Classify a page by its visible text, ignoring scripts and form controls
    pub fn classify_markup(&self, html: &str) -> PageSignal {
        let document = Html::parse_document(html);
        self.classify(&visible_text(document.root_element()))
    }
}

/// Option labels of a `<select>` by id, placeholder entries removed.
/// A missing control yields an empty list, which means "no data at this level".
pub fn select_options(html: &str, select_id: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse(&format!("select#{} option", select_id)) else {
        return Vec::new();
    };

    document
        .select(&selector)
        .filter_map(|option| {
            let label = option.text().collect::<String>().trim().to_string();
            let value = option.value().attr("value").unwrap_or("").trim();
            if label.is_empty() || is_placeholder(&label, value) {
                None
            } else {
                Some(label)
            }
        })
        .collect()
}

fn is_placeholder(label: &str, value: &str) -> bool {
    let lower = label.to_lowercase();
    value == "0"
        || value == "-1"
        || lower.starts_with("select")
        || lower.starts_with("--")
        || lower.contains("ಆಯ್ಕೆ")
}

/// Whether the cascading form is present at all
pub fn form_present(html: &str, ids: &ElementIds) -> bool {
    let document = Html::parse_document(html);
    Selector::parse(&format!("#{}", ids.district))
        .map(|selector| document.select(&selector).next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::HarvestConfig;

    fn phrases() -> PhraseSet {
        PhraseSet::from_settings(&HarvestConfig::default().portal)
    }

    #[test]
    fn test_session_phrase_wins_over_issue_phrase() {
        let signal = phrases().classify("Server error: Your Session has expired, please login again");
        assert_eq!(signal, PageSignal::SessionExpired("session has expired".to_string()));
    }

    #[test]
    fn test_portal_issue_and_clear() {
        let phrases = phrases();
        assert!(matches!(
            phrases.classify("We are facing issues. Please try again later."),
            PageSignal::PortalIssue(_)
        ));
        assert_eq!(phrases.classify("Owner Extent Khata"), PageSignal::Clear);
        assert!(phrases.classify("ಸೆಷನ್ ಮುಗಿದಿದೆ").into_result().is_err());
    }

    #[test]
    fn test_markup_ignores_script_text() {
        let html = r#"<html><body><p>Results</p><script>if (x) alert("server error");</script></body></html>"#;
        assert_eq!(phrases().classify_markup(html), PageSignal::Clear);
    }

    #[test]
    fn test_select_options_drop_placeholders() {
        let html = r#"
            <select id="ctl00_MainContent_ddlCSurnocNo">
                <option value="0">Select Surnoc</option>
                <option value="*">*</option>
                <option value="1">1</option>
            </select>"#;
        assert_eq!(select_options(html, "ctl00_MainContent_ddlCSurnocNo"), vec!["*", "1"]);
        assert!(select_options(html, "ctl00_MainContent_ddlCHissaNo").is_empty());
    }

    #[test]
    fn test_form_presence() {
        let ids = HarvestConfig::default().portal.element_ids;
        assert!(form_present(r#"<select id="ctl00_MainContent_ddlCDistrict"></select>"#, &ids));
        assert!(!form_present("<p>maintenance</p>", &ids));
    }
}
