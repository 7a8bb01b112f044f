//! Accessibility role vocabulary.
//!
//! Roles are carried in the AX spelling (`AXButton`, `AXTextField`). Locators may use
//! either that spelling or a generic name (`button`, `textfield`), which expands to
//! the set of AX roles that can play that part.

/// Structural container roles. A node with one of these roles and no title, value
/// or description costs no semantic depth.
const TUNNEL_ROLES: &[&str] = &[
    "AXGroup",
    "AXGenericElement",
    "AXSplitGroup",
    "AXLayoutArea",
    "AXLayoutItem",
    "AXScrollArea",
    "AXUnknown",
];

const EDITABLE_ROLES: &[&str] = &[
    "AXTextField",
    "AXTextArea",
    "AXComboBox",
    "AXSearchField",
    "AXSecureTextField",
];

const SCROLLABLE_ROLES: &[&str] = &["AXScrollArea", "AXWebArea", "AXTable", "AXOutline", "AXList"];

pub const WINDOW: &str = "AXWindow";
pub const APPLICATION: &str = "AXApplication";
pub const SECURE_TEXT_FIELD: &str = "AXSecureTextField";

pub fn is_tunnel_role(role: &str) -> bool {
    TUNNEL_ROLES.contains(&role)
}

pub fn is_editable_role(role: &str) -> bool {
    EDITABLE_ROLES.contains(&role)
}

pub fn is_scrollable_role(role: &str) -> bool {
    SCROLLABLE_ROLES.contains(&role)
}

/// AX roles that satisfy a locator role filter.
pub fn expand_role(role: &str) -> Vec<&'static str> {
    match role.trim().to_lowercase().as_str() {
        "window" => vec!["AXWindow"],
        "button" => vec!["AXButton", "AXMenuItem", "AXMenuBarItem", "AXPopUpButton"],
        "checkbox" => vec!["AXCheckBox"],
        "radio" | "radiobutton" => vec!["AXRadioButton"],
        "menu" => vec!["AXMenu"],
        "menuitem" => vec!["AXMenuItem", "AXMenuBarItem"],
        "dialog" => vec!["AXSheet", "AXDialog"],
        "text" | "textfield" | "input" | "textbox" | "field" => vec![
            "AXTextField",
            "AXTextArea",
            "AXComboBox",
            "AXSearchField",
            "AXSecureTextField",
        ],
        "textarea" => vec!["AXTextArea"],
        "search" | "searchfield" => vec!["AXSearchField", "AXTextField"],
        "link" => vec!["AXLink"],
        "label" | "statictext" => vec!["AXStaticText"],
        "image" => vec!["AXImage"],
        "list" => vec!["AXList"],
        "listitem" | "cell" => vec!["AXCell", "AXRow"],
        "combobox" => vec!["AXPopUpButton", "AXComboBox"],
        "tab" | "tabitem" => vec!["AXRadioButton", "AXTab"],
        "tabgroup" => vec!["AXTabGroup"],
        "toolbar" => vec!["AXToolbar"],
        "group" => vec!["AXGroup"],
        "scrollarea" => vec!["AXScrollArea"],
        "webarea" => vec!["AXWebArea"],
        _ => Vec::new(),
    }
}

/// Whether an element's AX role satisfies the locator's role filter.
pub fn role_matches(filter: &str, actual: &str) -> bool {
    let filter = filter.trim();
    if filter.eq_ignore_ascii_case(actual) {
        return true;
    }
    expand_role(filter).iter().any(|candidate| *candidate == actual)
}

/// Plain-language name used when a role is described to the grounding model.
pub fn display_name(role: &str) -> &str {
    match role {
        "AXButton" => "button",
        "AXTextField" | "AXSearchField" | "AXSecureTextField" => "text field",
        "AXTextArea" => "text area",
        "AXComboBox" | "AXPopUpButton" => "dropdown",
        "AXCheckBox" => "checkbox",
        "AXRadioButton" => "radio button",
        "AXLink" => "link",
        "AXMenuItem" | "AXMenuBarItem" => "menu item",
        "AXStaticText" => "label",
        "AXImage" => "image",
        "AXCell" | "AXRow" => "list item",
        "AXTabGroup" => "tab bar",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_and_ax_spellings_both_match() {
        assert!(role_matches("button", "AXButton"));
        assert!(role_matches("AXButton", "AXButton"));
        assert!(role_matches("axbutton", "AXButton"));
        assert!(role_matches("textfield", "AXSearchField"));
        assert!(!role_matches("button", "AXLink"));
    }

    #[test]
    fn containers_are_tunnels_but_fields_are_not() {
        assert!(is_tunnel_role("AXGroup"));
        assert!(!is_tunnel_role("AXTextField"));
        assert!(is_editable_role("AXSecureTextField"));
        assert!(!is_editable_role("AXLink"));
    }
}
