use serde::Deserialize;
use serde::de::DeserializeOwned;

/// An accessor trait for a mirrored resource.
pub trait Resource: Clone + DeserializeOwned + Send + Sync + 'static {
    /// The kind this resource type declares on the wire.
    const KIND: &'static str;

    /// The kind carried by this particular object.
    ///
    /// Servers that multiplex several resource types over one stream may
    /// deliver objects whose declared kind differs from [`Self::KIND`].
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn metadata(&self) -> &ObjectMeta;
}

/// Standard object metadata.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: Option<String>,

    /// Opaque token identifying this object's point in the collection's
    /// change history. Never parsed, only carried.
    #[serde(default)]
    pub resource_version: String,

    /// Position of this object in the 64-bit hash space used to shard
    /// responsibility across peer mirrors.
    #[serde(default)]
    pub hashkey: Option<i64>,

    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

/// A reference to the object's owning controller.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,

    #[serde(default)]
    pub hashkey: Option<i64>,
}

/// List-level metadata, only really used for its `resourceVersion` and
/// continuation token.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListMeta {
    #[serde(default, rename = "resourceVersion")]
    pub resource_version: Option<String>,

    #[serde(default)]
    pub r#continue: Option<String>,
}

/// A generic resource list as returned from bulk list calls.
#[derive(Clone, Debug, Deserialize)]
pub struct ObjectList<T> {
    pub metadata: ListMeta,

    /// The items we are actually interested in.
    pub items: Vec<T>,
}
