//! Owner labels on records and the mapping back to owner keys.

use crate::client::ObjectKey;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Derives a label value from an owner and parses it back into a key.
pub trait ObjectLabeler: Send + Sync {
    /// Label value identifying the object
    fn label_value(&self, meta: &ObjectMeta) -> String;

    /// Key of the object identified by the label value
    fn object_key(&self, label_value: &str) -> ObjectKey;
}

/// Labeler for cluster scoped owners such as Nodes: the value is the name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterObjectLabeler;

impl ObjectLabeler for ClusterObjectLabeler {
    fn label_value(&self, meta: &ObjectMeta) -> String {
        meta.name.clone().unwrap_or_default()
    }

    fn object_key(&self, label_value: &str) -> ObjectKey {
        ObjectKey::cluster(label_value)
    }
}

/// Labeler for namespaced owners such as Services: the value is
/// `<namespace><separator><name>`.
#[derive(Debug, Clone)]
pub struct NamespacedObjectLabeler {
    separator: String,
}

impl NamespacedObjectLabeler {
    /// Create a labeler joining namespace and name with `separator`
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
        }
    }
}

impl ObjectLabeler for NamespacedObjectLabeler {
    fn label_value(&self, meta: &ObjectMeta) -> String {
        match meta.name.as_deref() {
            None | Some("") => String::new(),
            Some(name) => format!(
                "{}{}{}",
                meta.namespace.as_deref().unwrap_or_default(),
                self.separator,
                name
            ),
        }
    }

    fn object_key(&self, label_value: &str) -> ObjectKey {
        let parts: Vec<&str> = label_value.split(self.separator.as_str()).collect();
        match parts.as_slice() {
            [namespace, name] => ObjectKey::namespaced(*namespace, *name),
            _ => ObjectKey::cluster(""),
        }
    }
}

/// Maps a record to the key of its owner through an owner label.
pub struct LabelMapper {
    labeler: Box<dyn ObjectLabeler>,
    label: String,
}

impl std::fmt::Debug for LabelMapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabelMapper").field("label", &self.label).finish_non_exhaustive()
    }
}

impl LabelMapper {
    /// Create a mapper reading `label` with `labeler`
    pub fn new(labeler: impl ObjectLabeler + 'static, label: impl Into<String>) -> Self {
        Self {
            labeler: Box::new(labeler),
            label: label.into(),
        }
    }

    /// Owner key of the object. An empty name means the object has no owner.
    pub fn map(&self, meta: &ObjectMeta) -> ObjectKey {
        match meta.labels.as_ref().and_then(|l| l.get(&self.label)) {
            Some(value) => self.labeler.object_key(value),
            None => ObjectKey::cluster(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
        ObjectMeta {
            namespace: namespace.map(str::to_string),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_cluster_object_labeler() {
        let labeler = ClusterObjectLabeler;
        assert_eq!(labeler.label_value(&meta(None, "node1")), "node1");
        assert_eq!(labeler.object_key("node1"), ObjectKey::cluster("node1"));
    }

    #[test]
    fn test_namespaced_object_labeler() {
        let labeler = NamespacedObjectLabeler::new(".");
        assert_eq!(labeler.label_value(&meta(Some("test"), "svc1")), "test.svc1");
        assert_eq!(labeler.label_value(&meta(Some("test"), "")), "");
        assert_eq!(labeler.object_key("test.svc1"), ObjectKey::namespaced("test", "svc1"));
        // Values without exactly two parts have no owner
        assert_eq!(labeler.object_key("svc1").name, "");
        assert_eq!(labeler.object_key("a.b.c").name, "");
    }

    #[test]
    fn test_label_mapper() {
        let mapper = LabelMapper::new(NamespacedObjectLabeler::new("."), "owner");
        let mut m = meta(Some("kube-system"), "record");
        assert_eq!(mapper.map(&m).name, "");

        m.labels = Some(BTreeMap::from([("owner".to_string(), "test.svc1".to_string())]));
        assert_eq!(mapper.map(&m), ObjectKey::namespaced("test", "svc1"));
    }
}
