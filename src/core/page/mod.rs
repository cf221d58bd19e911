use scraper::{ElementRef, Html, Selector};

const WORDS_PER_MINUTE: usize = 200;
const TEXT_WIDTH: usize = 120;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageMetadata {
    pub title: Option<String>,
    /// Minutes.
    pub reading_time: i64,
}

pub fn parse_page(html: &str) -> PageMetadata {
    let document = Html::parse_document(html);
    let title = select_first(&document, r#"meta[property="og:title"]"#)
        .and_then(|element| element.value().attr("content").map(ToString::to_string))
        .or_else(|| {
            select_first(&document, "head title")
                .map(|element| element.text().collect::<String>())
        })
        .map(|title| collapse_whitespace(&title))
        .filter(|title| !title.is_empty());

    PageMetadata {
        title,
        reading_time: reading_time(html),
    }
}

pub fn reading_time(html: &str) -> i64 {
    let text = html2text::from_read(html.as_bytes(), TEXT_WIDTH);
    let words = text
        .split_whitespace()
        .filter(|word| word.chars().any(char::is_alphanumeric))
        .count();
    i64::try_from(words / WORDS_PER_MINUTE).unwrap_or(i64::MAX)
}

pub fn is_html(content_type: Option<&str>) -> bool {
    match content_type {
        Some(value) => value.to_lowercase().contains("html"),
        None => true,
    }
}

fn select_first<'a>(document: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    document.select(&selector).next()
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
