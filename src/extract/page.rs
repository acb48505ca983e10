use scraper::{ElementRef, Html, Node, Selector};

/// Never rendered, so never part of the visible text.
const HIDDEN: &[&str] = &["head", "script", "style", "noscript", "template"];

/// Rendered on their own line.
const BLOCKS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "footer",
    "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav", "ol",
    "p", "pre", "section", "table", "tr", "ul",
];

/// A rendered search-result page. Plain text is accepted too; it parses as
/// a body with a single text node.
pub struct Page {
    html: Html,
}

impl Page {
    pub fn parse(document: &str) -> Self {
        Page {
            html: Html::parse_document(document),
        }
    }

    /// Visible text: hidden elements dropped, one line per block element.
    pub fn text(&self) -> String {
        visible_text(self.html.root_element())
    }

    pub fn first_text(&self, selector: &Selector) -> Option<String> {
        self.html.select(selector).next().map(visible_text)
    }

    pub fn texts(&self, selector: &Selector) -> Vec<String> {
        self.html.select(selector).map(visible_text).collect()
    }
}

fn visible_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect(el, &mut out);
    out
}

fn collect(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => out.push_str(t),
            Node::Element(e) => {
                let name = e.name();
                if HIDDEN.contains(&name) {
                    continue;
                }
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let block = BLOCKS.contains(&name);
                if block {
                    line_break(out);
                }
                collect(child_el, out);
                if block {
                    line_break(out);
                }
            }
            _ => {}
        }
    }
}

fn line_break(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}
