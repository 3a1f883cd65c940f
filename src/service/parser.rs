//! Selector evaluation over fetched HTML.
//!
//! CSS expressions run on the scraper engine and support the trailing
//! `::text` / `::attr(name)` forms; XPath expressions run on skyscraper.
//! A container selector enumerates record-holding nodes (auto-detected as
//! XPath when the expression starts with `/`); each field is then
//! evaluated relative to its container node honoring the field's declared
//! kind. No match is absent, one match is a scalar, several matches are an
//! ordered sequence.

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

use crate::domain::config::{FieldConfig, SelectorKind, SelectorsConfig};
use crate::service::transforms::apply_transforms;

/// Raised when a selector is invalid or cannot be evaluated.
#[derive(Debug, Error)]
#[error("Parse error: {0}")]
pub struct ParseError(pub String);

/// One extracted record, keyed by field name.
pub type RawRecord = BTreeMap<String, Value>;

/// What to pull out of a CSS-matched element.
enum CssExtract {
    /// The element's outer HTML
    Node,
    /// Concatenated descendant text
    Text,
    /// A named attribute; elements without it are skipped
    Attr(String),
}

/// Split a parsel-style CSS expression into the element selector and the
/// extraction suffix.
fn split_css_extract(selector: &str) -> (String, CssExtract) {
    if let Some(stripped) = selector.strip_suffix("::text") {
        return (stripped.trim().to_string(), CssExtract::Text);
    }
    if let Some(open) = selector.rfind("::attr(") {
        if let Some(stripped) = selector[open..].strip_prefix("::attr(") {
            if let Some(name) = stripped.strip_suffix(')') {
                return (selector[..open].trim().to_string(), CssExtract::Attr(name.to_string()));
            }
        }
    }
    (selector.trim().to_string(), CssExtract::Node)
}

/// CSS vs XPath auto-detection for the container expression.
fn infer_kind(expression: &str) -> SelectorKind {
    if expression.trim_start().starts_with('/') {
        SelectorKind::Xpath
    } else {
        SelectorKind::Css
    }
}

fn css_selector(expression: &str) -> Result<Selector, ParseError> {
    Selector::parse(expression)
        .map_err(|e| ParseError(format!("Invalid css selector '{expression}': {e}")))
}

fn extract_from_element(element: ElementRef<'_>, extract: &CssExtract) -> Option<String> {
    match extract {
        CssExtract::Node => Some(element.html()),
        CssExtract::Text => Some(element.text().collect::<String>()),
        CssExtract::Attr(name) => element.value().attr(name).map(str::to_string),
    }
}

/// Collapse matched values into the absent / scalar / sequence shape.
fn values_to_value(values: Vec<String>) -> Value {
    match values.len() {
        0 => Value::Null,
        1 => Value::String(values.into_iter().next().unwrap_or_default()),
        _ => Value::Array(values.into_iter().map(Value::String).collect()),
    }
}

fn css_eval_fragment(root: ElementRef<'_>, expression: &str) -> Result<Value, ParseError> {
    let (element_part, extract) = split_css_extract(expression);
    let selector = css_selector(&element_part)?;
    let values = root
        .select(&selector)
        .filter_map(|el| extract_from_element(el, &extract))
        .collect();
    Ok(values_to_value(values))
}

fn css_eval_document(html: &Html, expression: &str) -> Result<Value, ParseError> {
    let (element_part, extract) = split_css_extract(expression);
    let selector = css_selector(&element_part)?;
    let values = html
        .select(&selector)
        .filter_map(|el| extract_from_element(el, &extract))
        .collect();
    Ok(values_to_value(values))
}

/// Extract a field value from an HTML document using the declared kind.
pub fn parse_field(html: &str, selector: &str, kind: SelectorKind) -> Result<Value, ParseError> {
    match kind {
        SelectorKind::Css => {
            let document = Html::parse_document(html);
            css_eval_document(&document, selector)
        }
        SelectorKind::Xpath => Ok(values_to_value(xpath_eval::eval_document(html, selector)?)),
    }
}

/// Extract records from HTML based on the `selectors` block.
///
/// With a container selector, one record is built per container node; with
/// none, a single record is built from the whole document.
pub fn parse_records(html: &str, selectors: &SelectorsConfig) -> Result<Vec<RawRecord>, ParseError> {
    let Some(container) = selectors
        .container
        .as_deref()
        .filter(|c| !c.trim().is_empty())
    else {
        return Ok(vec![parse_single_record(html, &selectors.fields)?]);
    };

    let records = match infer_kind(container) {
        SelectorKind::Css => parse_css_container(html, container, &selectors.fields)?,
        SelectorKind::Xpath => parse_xpath_container(html, container, &selectors.fields)?,
    };

    if records.is_empty() {
        log::warn!("Container selector '{container}' matched 0 elements.");
    }
    Ok(records)
}

fn parse_single_record(
    html: &str,
    fields: &BTreeMap<String, FieldConfig>,
) -> Result<RawRecord, ParseError> {
    let document = Html::parse_document(html);
    let mut record = RawRecord::new();
    for (name, field) in fields {
        let value = match field.kind {
            SelectorKind::Css => css_eval_document(&document, &field.selector)?,
            SelectorKind::Xpath => {
                values_to_value(xpath_eval::eval_document(html, &field.selector)?)
            }
        };
        record.insert(name.clone(), apply_transforms(value, field));
    }
    Ok(record)
}

fn parse_css_container(
    html: &str,
    container: &str,
    fields: &BTreeMap<String, FieldConfig>,
) -> Result<Vec<RawRecord>, ParseError> {
    let document = Html::parse_document(html);
    let container_selector = css_selector(container)?;

    let mut records = Vec::new();
    for node in document.select(&container_selector) {
        let mut record = RawRecord::new();
        for (name, field) in fields {
            let value = match field.kind {
                SelectorKind::Css => css_eval_fragment(node, &field.selector)?,
                // An XPath field inside a CSS container is evaluated on
                // the container's own fragment.
                SelectorKind::Xpath => {
                    values_to_value(xpath_eval::eval_document(&node.html(), &field.selector)?)
                }
            };
            record.insert(name.clone(), apply_transforms(value, field));
        }
        records.push(record);
    }
    Ok(records)
}

fn parse_xpath_container(
    html: &str,
    container: &str,
    fields: &BTreeMap<String, FieldConfig>,
) -> Result<Vec<RawRecord>, ParseError> {
    let field_exprs: Vec<(&String, &FieldConfig)> = fields.iter().collect();
    let raw = xpath_eval::eval_container_fields(
        html,
        container,
        &field_exprs
            .iter()
            .map(|(name, field)| {
                let expr = match field.kind {
                    SelectorKind::Xpath => Some(field.selector.as_str()),
                    SelectorKind::Css => {
                        log::warn!(
                            "CSS field selector '{}' inside an XPath container is not supported; value will be absent",
                            field.selector
                        );
                        None
                    }
                };
                (name.as_str(), expr)
            })
            .collect::<Vec<_>>(),
    )?;

    let mut records = Vec::new();
    for row in raw {
        let mut record = RawRecord::new();
        for ((name, field), values) in field_exprs.iter().zip(row) {
            let value = match values {
                Some(values) => values_to_value(values),
                None => Value::Null,
            };
            record.insert((*name).clone(), apply_transforms(value, field));
        }
        records.push(record);
    }
    Ok(records)
}

/// Find a next-page href with the configured selector. A bare CSS element
/// selector falls back to the element's `href` attribute.
pub fn extract_href(
    html: &str,
    selector: &str,
    kind: SelectorKind,
) -> Result<Option<String>, ParseError> {
    match kind {
        SelectorKind::Css => {
            let document = Html::parse_document(html);
            let (element_part, extract) = split_css_extract(selector);
            let compiled = css_selector(&element_part)?;
            let Some(element) = document.select(&compiled).next() else {
                return Ok(None);
            };
            let value = match extract {
                CssExtract::Node => element.value().attr("href").map(str::to_string),
                other => extract_from_element(element, &other),
            };
            Ok(value.filter(|v| !v.is_empty()))
        }
        SelectorKind::Xpath => {
            let values = xpath_eval::eval_document(html, selector)?;
            Ok(values.into_iter().find(|v| !v.is_empty()))
        }
    }
}

/// XPath evaluation on the skyscraper engine, kept behind a narrow seam.
mod xpath_eval {
    use super::ParseError;
    use skyscraper::html;
    use skyscraper::xpath::grammar::data_model::XpathItem;
    use skyscraper::xpath::{self, XpathItemTree};

    fn parse_document(html_text: &str) -> Result<XpathItemTree, ParseError> {
        html::parse(html_text).map_err(|e| ParseError(format!("Invalid HTML document: {e}")))
    }

    fn parse_expr(expr: &str) -> Result<xpath::Xpath, ParseError> {
        xpath::parse(expr).map_err(|e| ParseError(format!("Invalid xpath selector '{expr}': {e}")))
    }

    fn item_to_string(tree: &XpathItemTree, item: &XpathItem) -> String {
        use skyscraper::xpath::grammar::XpathItemTreeNode;
        match item {
            XpathItem::Node(node) => match *node {
                XpathItemTreeNode::AttributeNode(attribute) => attribute.value.clone(),
                XpathItemTreeNode::TextNode(text) => text.content.clone(),
                other => other.text(tree).unwrap_or_default(),
            },
            XpathItem::Function(function) => format!("{function:?}"),
            XpathItem::AnyAtomicType(atomic) => format!("{atomic:?}"),
        }
    }

    /// Evaluate an absolute expression against a document, returning the
    /// matched values as strings.
    pub fn eval_document(html_text: &str, expr: &str) -> Result<Vec<String>, ParseError> {
        let tree = parse_document(html_text)?;
        let xpath = parse_expr(expr)?;
        let items = xpath
            .apply(&tree)
            .map_err(|e| ParseError(format!("xpath '{expr}' failed: {e}")))?;
        Ok(items.iter().map(|item| item_to_string(&tree, item)).collect())
    }

    /// Enumerate container nodes and evaluate each field expression
    /// relative to its container. Fields with `None` expressions yield
    /// `None` (unsupported kind combination).
    pub fn eval_container_fields(
        html_text: &str,
        container_expr: &str,
        fields: &[(&str, Option<&str>)],
    ) -> Result<Vec<Vec<Option<Vec<String>>>>, ParseError> {
        let tree = parse_document(html_text)?;
        let container = parse_expr(container_expr)?;
        let items = container
            .apply(&tree)
            .map_err(|e| ParseError(format!("xpath '{container_expr}' failed: {e}")))?;

        let mut parsed_fields = Vec::with_capacity(fields.len());
        for (_, expr) in fields {
            parsed_fields.push(match expr {
                Some(expr) => Some(parse_expr(expr)?),
                None => None,
            });
        }

        let mut rows = Vec::new();
        for item in items.iter() {
            let mut row = Vec::with_capacity(fields.len());
            for field in &parsed_fields {
                match field {
                    Some(xpath) => {
                        let values = xpath
                            .apply_to_item(&tree, item.clone())
                            .map_err(|e| ParseError(format!("relative xpath failed: {e}")))?;
                        row.push(Some(
                            values
                                .iter()
                                .map(|value| item_to_string(&tree, value))
                                .collect(),
                        ));
                    }
                    None => row.push(None),
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::{CastType, TransformKind};
    use serde_json::json;

    const BOOKS_HTML: &str = r#"
        <html><body>
            <article class="book">
                <h2>  Dune  </h2>
                <span class="price">$9.99</span>
                <a href="/books/dune">details</a>
            </article>
            <article class="book">
                <h2>  Neuromancer  </h2>
                <span class="price">$12.50</span>
                <a href="/books/neuromancer">details</a>
            </article>
        </body></html>
    "#;

    fn field(selector: &str, kind: SelectorKind) -> FieldConfig {
        FieldConfig {
            selector: selector.into(),
            kind,
            transform: None,
            transform_pattern: None,
            cast_type: None,
            default: None,
        }
    }

    fn books_selectors() -> SelectorsConfig {
        let mut fields = BTreeMap::new();
        let mut title = field("h2::text", SelectorKind::Css);
        title.transform = Some(TransformKind::Strip);
        fields.insert("title".to_string(), title);
        let mut price = field("span.price::text", SelectorKind::Css);
        price.transform = Some(TransformKind::Regex);
        price.transform_pattern = Some("([0-9.]+)".into());
        fields.insert("price".to_string(), price);
        SelectorsConfig {
            container: Some("article.book".into()),
            fields,
        }
    }

    #[test]
    fn one_record_per_container_node_with_transforms() {
        let records = parse_records(BOOKS_HTML, &books_selectors()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["title"], json!("Dune"));
        assert_eq!(records[0]["price"], json!("9.99"));
        assert_eq!(records[1]["title"], json!("Neuromancer"));
        assert_eq!(records[1]["price"], json!("12.50"));
    }

    #[test]
    fn no_container_yields_a_single_record() {
        let mut fields = BTreeMap::new();
        fields.insert("first_title".into(), field("h2::text", SelectorKind::Css));
        let selectors = SelectorsConfig {
            container: None,
            fields,
        };
        let records = parse_records(BOOKS_HTML, &selectors).unwrap();
        assert_eq!(records.len(), 1);
        // Two h2 matches collapse into an ordered sequence.
        assert_eq!(
            records[0]["first_title"],
            json!(["  Dune  ", "  Neuromancer  "])
        );
    }

    #[test]
    fn empty_container_match_yields_no_records() {
        let mut selectors = books_selectors();
        selectors.container = Some("div.missing".into());
        let records = parse_records(BOOKS_HTML, &selectors).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn absent_field_is_null() {
        let mut selectors = books_selectors();
        selectors
            .fields
            .insert("isbn".into(), field("span.isbn::text", SelectorKind::Css));
        let records = parse_records(BOOKS_HTML, &selectors).unwrap();
        assert_eq!(records[0]["isbn"], Value::Null);
    }

    #[test]
    fn attr_extraction_via_css_suffix() {
        let value = parse_field(BOOKS_HTML, "article.book a::attr(href)", SelectorKind::Css).unwrap();
        assert_eq!(value, json!(["/books/dune", "/books/neuromancer"]));
    }

    #[test]
    fn invalid_css_selector_is_a_parse_error() {
        let err = parse_field(BOOKS_HTML, "li[unclosed", SelectorKind::Css).unwrap_err();
        assert!(err.to_string().contains("Invalid css selector"));
    }

    #[test]
    fn xpath_fields_evaluate_against_the_document() {
        let value = parse_field(BOOKS_HTML, "//article//h2", SelectorKind::Xpath).unwrap();
        match value {
            Value::Array(items) => assert_eq!(items.len(), 2),
            other => panic!("expected two matches, got {other:?}"),
        }
    }

    #[test]
    fn xpath_container_with_relative_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("title".into(), field(".//h2", SelectorKind::Xpath));
        let selectors = SelectorsConfig {
            container: Some("//article".into()),
            fields,
        };
        let records = parse_records(BOOKS_HTML, &selectors).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0]["title"].as_str().unwrap().contains("Dune"));
    }

    #[test]
    fn extract_href_supports_bare_and_suffixed_selectors() {
        let html = r#"<html><body><li class="next"><a href="/page/2">next</a></li></body></html>"#;
        let bare = extract_href(html, "li.next > a", SelectorKind::Css).unwrap();
        assert_eq!(bare.as_deref(), Some("/page/2"));
        let suffixed = extract_href(html, "li.next > a::attr(href)", SelectorKind::Css).unwrap();
        assert_eq!(suffixed.as_deref(), Some("/page/2"));
        let missing = extract_href(html, "li.prev > a", SelectorKind::Css).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn cast_transform_applies_during_parse() {
        let html = r#"<html><body><div class="n">41</div><div class="n">42</div></body></html>"#;
        let mut fields = BTreeMap::new();
        let mut count = field("div.n::text", SelectorKind::Css);
        count.transform = Some(TransformKind::Cast);
        count.cast_type = Some(CastType::Int);
        fields.insert("count".into(), count);
        let selectors = SelectorsConfig {
            container: None,
            fields,
        };
        let records = parse_records(html, &selectors).unwrap();
        assert_eq!(records[0]["count"], json!([41, 42]));
    }
}
