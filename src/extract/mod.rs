pub mod matching;
pub mod signals;
pub mod table;

use scraper::node::Node;
use scraper::ElementRef;
use serde::{Serialize, Deserialize};

pub use matching::{is_owner_match, owner_variants};
pub use signals::{PageSignal, PhraseSet};
pub use table::extract_owners;

/// One owner row pulled out of a results page
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRow {
    pub owner_name: String,
    pub extent: Option<String>,
    /// Khata number, the record's secondary identifier
    pub khata: Option<String>,
}

/// Elements whose text is never result data
pub(crate) const IGNORED_TAGS: [&str; 11] = [
    "select", "option", "button", "input", "textarea", "script", "style", "nav", "header",
    "footer", "noscript",
];

/// Text of `element` with interactive controls and page chrome removed,
/// one line per text node.
pub(crate) fn visible_lines(element: ElementRef<'_>) -> Vec<String> {
    let mut lines = Vec::new();
    collect_text(element, &mut lines);
    lines
}

/// Whitespace-collapsed visible text of `element`
pub(crate) fn visible_text(element: ElementRef<'_>) -> String {
    visible_lines(element).join(" ")
}

fn collect_text(element: ElementRef<'_>, lines: &mut Vec<String>) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
                if !line.is_empty() {
                    lines.push(line);
                }
            }
            Node::Element(el) if IGNORED_TAGS.contains(&el.name()) => {}
            Node::Element(_) => {
                if let Some(child) = ElementRef::wrap(child) {
                    collect_text(child, lines);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::Html;

    #[test]
    fn test_visible_text_skips_controls() {
        let html = Html::parse_fragment(
            "<div>Owner: <b>Ramesh</b><select><option>Select District</option></select>\
             <script>var x = 'error';</script><button>Go</button></div>",
        );
        let text = visible_text(html.root_element());
        assert_eq!(text, "Owner: Ramesh");
    }
}
