//! Scraper-based DOM heuristics for pages that cannot run scripts.
//!
//! `scraper::Html` is not `Send`, so everything here is synchronous and
//! returns owned data.

use scraper::{ElementRef, Html, Selector};

use crate::download::safe_filename;

/// How far up a link the section walk looks.
const MAX_ANCESTOR_DEPTH: usize = 10;

/// Selectors for a section's heading, most specific first.
const SECTION_TITLE_SELECTORS: [&str; 6] = [
    ".sectionname",
    "h3.sectionname",
    r#"[data-for="section_title"]"#,
    "h3",
    ".section-title",
    r#"[class*="sectionname"]"#,
];

type ContainerTest = fn(&ElementRef<'_>) -> bool;

/// Container predicates in priority order; each is tried on all ancestors
/// before the next.
const CONTAINER_TESTS: [ContainerTest; 5] = [
    is_section_item,
    is_section_element,
    has_section_id,
    has_section_class,
    has_section_like_class,
];

fn is_section_item(el: &ElementRef<'_>) -> bool {
    el.value().name() == "li" && has_section_prefix_id(el)
}

fn is_section_element(el: &ElementRef<'_>) -> bool {
    el.value().name() == "section"
}

fn has_section_id(el: &ElementRef<'_>) -> bool {
    el.value().attr("data-sectionid").is_some()
}

fn has_section_class(el: &ElementRef<'_>) -> bool {
    el.value().classes().any(|c| c == "section")
}

fn has_section_like_class(el: &ElementRef<'_>) -> bool {
    el.value().classes().any(|c| c.contains("section"))
}

fn has_section_prefix_id(el: &ElementRef<'_>) -> bool {
    el.value().id().is_some_and(|id| id.starts_with("section-"))
}

/// Section label for every `a[href]` in `html`, in document order.
///
/// `None` where no section container or heading is found. Labels are
/// filesystem-safe.
pub(crate) fn link_sections(html: &str) -> Vec<Option<String>> {
    let Ok(links) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let document = Html::parse_document(html);
    document.select(&links).map(section_of).collect()
}

fn section_of(link: ElementRef<'_>) -> Option<String> {
    let ancestors: Vec<ElementRef<'_>> = link.ancestors().filter_map(ElementRef::wrap).collect();

    let container = CONTAINER_TESTS
        .iter()
        .find_map(|test| ancestors.iter().find(|el| test(el)))
        .or_else(|| {
            ancestors
                .iter()
                .take(MAX_ANCESTOR_DEPTH)
                .find(|el| has_section_prefix_id(el))
        })?;

    section_title(container)
        .or_else(|| first_text_line(container))
        .map(|title| safe_filename(&title))
}

fn section_title(container: &ElementRef<'_>) -> Option<String> {
    SECTION_TITLE_SELECTORS.iter().find_map(|raw| {
        let selector = Selector::parse(raw).ok()?;
        let heading = container.select(&selector).next()?;
        let text = heading.text().collect::<String>();
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
        (!text.is_empty()).then_some(text)
    })
}

fn first_text_line(container: &ElementRef<'_>) -> Option<String> {
    container
        .text()
        .flat_map(str::lines)
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
