//! Navigation panel markup.

use crate::registry::ServiceEntry;

/// Icon glyph for a service, keyed by registry name. Unknown services get
/// a generic marker.
pub fn glyph_for(name: &str) -> &'static str {
    match name {
        "helm" => "⎈",
        "codex" => "▤",
        "ledger" => "▦",
        "core" => "◆",
        "knowledgetree" => "❧",
        "template" => "▧",
        _ => "▪",
    }
}

/// Human label for a service: the registry name with the first letter
/// upper-cased. Registry names are `[a-z0-9_-]+`, so no escaping is needed.
pub fn label_for(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}

/// Render the side panel for the given (already permission-filtered)
/// entries.
pub fn panel_html(entries: &[&ServiceEntry]) -> String {
    let mut out = String::from(r#"<nav id="nexus-nav" class="side-panel"><ul>"#);
    for entry in entries {
        out.push_str(&format!(
            r#"<li><a href="/{name}/"><span class="glyph">{glyph}</span><span class="label">{label}</span></a></li>"#,
            name = entry.name,
            glyph = glyph_for(&entry.name),
            label = label_for(&entry.name),
        ));
    }
    out.push_str("</ul></nav>");
    out
}
