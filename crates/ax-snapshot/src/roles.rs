//! Fixed role vocabularies driving the interesting-node predicate.

const CONTROL_ROLES: &[&str] = &[
    "button",
    "checkbox",
    "combobox",
    "listbox",
    "menu",
    "menubar",
    "menuitem",
    "menuitemcheckbox",
    "menuitemradio",
    "option",
    "progressbar",
    "radio",
    "scrollbar",
    "searchbox",
    "slider",
    "spinbutton",
    "switch",
    "tab",
    "tablist",
    "textbox",
    "tree",
    "treeitem",
    "link",
    "gridcell",
];

const LANDMARK_ROLES: &[&str] = &[
    "banner",
    "complementary",
    "contentinfo",
    "form",
    "main",
    "navigation",
    "region",
    "search",
];

const LEAF_ROLES: &[&str] = &[
    "textbox",
    "searchbox",
    "image",
    "progressbar",
    "slider",
    "separator",
    "meter",
    "scrollbar",
    "spinbutton",
];

pub fn is_control_role(role: &str) -> bool {
    CONTROL_ROLES.contains(&role)
}

pub fn is_landmark_role(role: &str) -> bool {
    LANDMARK_ROLES.contains(&role)
}

pub fn is_leaf_role(role: &str) -> bool {
    LEAF_ROLES.contains(&role)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_sets_do_not_overlap_with_landmarks() {
        for role in LANDMARK_ROLES {
            assert!(!is_control_role(role), "{role} must not be a control");
        }
    }

    #[test]
    fn spot_checks() {
        assert!(is_control_role("gridcell"));
        assert!(is_landmark_role("search"));
        assert!(is_leaf_role("separator"));
        assert!(!is_control_role("heading"));
    }
}
