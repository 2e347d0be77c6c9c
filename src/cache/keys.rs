//! Cache key composition.
//!
//! Keys are plain strings of the form `namespace:stable_id[?name=value&...]`.
//! Attribute names are sorted so that equal attribute sets always produce the
//! same key regardless of map iteration order; values are percent-encoded as
//! UTF-8 form data.

use std::collections::HashMap;

use url::form_urlencoded;

/// Named attributes contributing to a key. `None` serialises as an empty value.
pub type AttributeMap = HashMap<String, Option<String>>;

/// Build a key from a single attribute map.
pub fn build(
    namespace: &str,
    stable_id: &str,
    attributes: &AttributeMap,
    include_attributes: bool,
) -> String {
    build_scoped(
        namespace,
        stable_id,
        attributes,
        &AttributeMap::new(),
        include_attributes,
    )
}

/// Build a key from persistent and transient attribute maps.
///
/// A name present in both maps is emitted once, taking the first non-null
/// value with the persistent map consulted first.
pub fn build_scoped(
    namespace: &str,
    stable_id: &str,
    persistent: &AttributeMap,
    transient: &AttributeMap,
    include_attributes: bool,
) -> String {
    let mut key = format!("{namespace}:{stable_id}");
    if !include_attributes {
        return key;
    }

    let mut names: Vec<&str> = persistent
        .keys()
        .chain(transient.keys())
        .map(String::as_str)
        .collect();
    if names.is_empty() {
        return key;
    }
    names.sort_unstable();
    names.dedup();

    key.push('?');
    for (index, name) in names.into_iter().enumerate() {
        if index > 0 {
            key.push('&');
        }
        let value = persistent
            .get(name)
            .and_then(Option::as_deref)
            .or_else(|| transient.get(name).and_then(Option::as_deref))
            .unwrap_or_default();

        key.push_str(name);
        key.push('=');
        key.extend(form_urlencoded::byte_serialize(value.as_bytes()));
    }

    key
}

/// A placed portal component whose rendered output is cached per instance.
#[derive(Debug, Clone, Default)]
pub struct CopletInstance {
    pub id: String,
    /// Resource the instance renders, usually a URI.
    pub locator: String,
    pub attributes: AttributeMap,
    /// Session-scoped attributes that are not persisted with the instance.
    pub temporary_attributes: AttributeMap,
}

impl CopletInstance {
    pub fn new(id: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            locator: locator.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), Some(value.into()));
        self
    }

    pub fn with_temporary_attribute(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.temporary_attributes
            .insert(name.into(), Some(value.into()));
        self
    }

    /// `namespace:id/locator[?attr=val&...]`
    pub fn cache_key(&self, namespace: &str, include_attributes: bool) -> String {
        build_scoped(
            namespace,
            &format!("{}/{}", self.id, self.locator),
            &self.attributes,
            &self.temporary_attributes,
            include_attributes,
        )
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn attributes(pairs: &[(&str, Option<&str>)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.map(str::to_string)))
            .collect()
    }

    #[test]
    fn without_attributes_key_is_namespace_and_id() {
        let attrs = attributes(&[("size", Some("max"))]);
        assert_eq!(build("coplet", "42", &attrs, false), "coplet:42");
    }

    #[test]
    fn attributes_are_sorted_by_name() {
        let attrs = attributes(&[("zeta", Some("1")), ("alpha", Some("2")), ("mid", Some("3"))]);
        assert_eq!(
            build("coplet", "42", &attrs, true),
            "coplet:42?alpha=2&mid=3&zeta=1"
        );
    }

    #[test]
    fn values_are_percent_encoded() {
        let attrs = attributes(&[("q", Some("a b&c=d/é"))]);
        assert_eq!(
            build("ns", "id", &attrs, true),
            "ns:id?q=a+b%26c%3Dd%2F%C3%A9"
        );
    }

    #[test]
    fn missing_values_serialize_as_empty() {
        let attrs = attributes(&[("a", None), ("b", Some("x"))]);
        assert_eq!(build("ns", "id", &attrs, true), "ns:id?a=&b=x");
    }

    #[test]
    fn empty_attribute_set_has_no_query() {
        assert_eq!(build("ns", "id", &AttributeMap::new(), true), "ns:id");
    }

    #[test]
    fn transient_attributes_merge_into_sorted_order() {
        let persistent = attributes(&[("skin", Some("dark"))]);
        let transient = attributes(&[("page", Some("2")), ("skin", Some("light"))]);

        assert_eq!(
            build_scoped("ns", "id", &persistent, &transient, true),
            "ns:id?page=2&skin=dark"
        );
    }

    #[test]
    fn null_persistent_value_falls_back_to_transient() {
        let persistent = attributes(&[("lang", None)]);
        let transient = attributes(&[("lang", Some("de"))]);

        assert_eq!(
            build_scoped("ns", "id", &persistent, &transient, true),
            "ns:id?lang=de"
        );
    }

    #[test]
    fn coplet_key_scheme() {
        let coplet = CopletInstance::new("42", "http://x/y");
        assert_eq!(coplet.cache_key("coplet", true), "coplet:42/http://x/y");

        let coplet = coplet
            .with_attribute("minimized", "false")
            .with_temporary_attribute("cursor", "a b");
        assert_eq!(
            coplet.cache_key("coplet", true),
            "coplet:42/http://x/y?cursor=a+b&minimized=false"
        );
        assert_eq!(coplet.cache_key("coplet", false), "coplet:42/http://x/y");
    }

    proptest! {
        #[test]
        fn prop_key_is_independent_of_insertion_order(
            pairs in prop::collection::btree_map("[a-z]{1,8}", prop::option::of("[ -~]{0,12}"), 0..8)
        ) {
            let forward: AttributeMap = pairs.clone().into_iter().collect();
            let mut reversed = AttributeMap::with_capacity(pairs.len());
            for (name, value) in pairs.into_iter().rev() {
                reversed.insert(name, value);
            }

            prop_assert_eq!(
                build("ns", "id", &forward, true),
                build("ns", "id", &reversed, true)
            );
        }

        #[test]
        fn prop_split_across_maps_matches_single_map(
            pairs in prop::collection::btree_map("[a-z]{1,8}", "[ -~]{0,12}", 0..8)
        ) {
            let single: AttributeMap = pairs
                .iter()
                .map(|(name, value)| (name.clone(), Some(value.clone())))
                .collect();
            let (persistent, transient): (Vec<_>, Vec<_>) = single
                .clone()
                .into_iter()
                .enumerate()
                .partition(|(index, _)| index % 2 == 0);
            let persistent: AttributeMap = persistent.into_iter().map(|(_, pair)| pair).collect();
            let transient: AttributeMap = transient.into_iter().map(|(_, pair)| pair).collect();

            prop_assert_eq!(
                build("ns", "id", &single, true),
                build_scoped("ns", "id", &persistent, &transient, true)
            );
        }
    }
}
