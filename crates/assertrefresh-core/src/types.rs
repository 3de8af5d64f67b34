//! Core types for assertion refresh.
//!
//! Assertions are identified by their type and primary key. Values here are
//! plain data: nothing in this module talks to the trust database or the network.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Revision used for an assertion we want but do not have locally.
pub const REVISION_NOT_KNOWN: i32 = -1;

/// Assertion types understood by the refresh machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssertionType {
    Account,
    AccountKey,
    PackageDeclaration,
    Store,
}

impl AssertionType {
    /// Wire name of the type.
    pub fn name(&self) -> &'static str {
        match self {
            AssertionType::Account => "account",
            AssertionType::AccountKey => "account-key",
            AssertionType::PackageDeclaration => "package-declaration",
            AssertionType::Store => "store",
        }
    }

    /// Header names forming the primary key, in order.
    pub fn primary_key(&self) -> &'static [&'static str] {
        match self {
            AssertionType::Account => &["account-id"],
            AssertionType::AccountKey => &["public-key-sha3-384"],
            AssertionType::PackageDeclaration => &["series", "package-id"],
            AssertionType::Store => &["store"],
        }
    }

    /// Highest assertion format this crate knows how to handle.
    pub fn max_supported_format(&self) -> u32 {
        match self {
            AssertionType::PackageDeclaration => 5,
            _ => 0,
        }
    }
}

impl fmt::Display for AssertionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reference to one assertion: type plus primary key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssertionRef {
    pub assertion_type: AssertionType,
    pub primary_key: Vec<String>,
}

impl AssertionRef {
    pub fn new(assertion_type: AssertionType, primary_key: Vec<String>) -> Self {
        Self {
            assertion_type,
            primary_key,
        }
    }

    /// Reference to the declaration binding `package_id` within `series`.
    pub fn declaration(series: &str, package_id: &str) -> Self {
        Self::new(
            AssertionType::PackageDeclaration,
            vec![series.to_string(), package_id.to_string()],
        )
    }

    /// Reference to the store-wide trust statement for `store`.
    pub fn store(store: &str) -> Self {
        Self::new(AssertionType::Store, vec![store.to_string()])
    }

    /// Whether the primary key has the arity its type requires and no empty parts.
    pub fn is_well_formed(&self) -> bool {
        self.primary_key.len() == self.assertion_type.primary_key().len()
            && self.primary_key.iter().all(|k| !k.is_empty())
    }

    pub fn at(&self, revision: i32) -> AtRevision {
        AtRevision {
            reference: self.clone(),
            revision,
        }
    }
}

impl fmt::Display for AssertionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.assertion_type,
            self.primary_key.join("; ")
        )
    }
}

/// An assertion reference pinned at a revision.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtRevision {
    pub reference: AssertionRef,
    pub revision: i32,
}

impl AtRevision {
    pub fn is_revision_known(&self) -> bool {
        self.revision != REVISION_NOT_KNOWN
    }
}

impl fmt::Display for AtRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_revision_known() {
            write!(f, "{} at revision {}", self.reference, self.revision)
        } else {
            write!(f, "{} at unknown revision", self.reference)
        }
    }
}

/// A signed trust statement.
///
/// Signatures are checked by the trust database, not here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub assertion_type: AssertionType,
    pub primary_key: Vec<String>,
    pub revision: i32,
    #[serde(default)]
    pub format: u32,
    /// Assertions that must be in the database before this one.
    #[serde(default)]
    pub prerequisites: Vec<AssertionRef>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Assertion {
    pub fn new(reference: AssertionRef, revision: i32) -> Self {
        Self {
            assertion_type: reference.assertion_type,
            primary_key: reference.primary_key,
            revision,
            format: 0,
            prerequisites: Vec::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_prerequisite(mut self, prerequisite: AssertionRef) -> Self {
        self.prerequisites.push(prerequisite);
        self
    }

    pub fn with_format(mut self, format: u32) -> Self {
        self.format = format;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn reference(&self) -> AssertionRef {
        AssertionRef::new(self.assertion_type, self.primary_key.clone())
    }

    pub fn is_format_supported(&self) -> bool {
        self.format <= self.assertion_type.max_supported_format()
    }
}

/// Pool-issued label for a set of groups sharing resolution work.
///
/// The transport treats it as opaque and echoes it back with results.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Grouping(pub String);

impl Grouping {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Installed revision info for a package.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideInfo {
    /// Identity bound by the package's declaration; `None` for local installs.
    pub package_id: Option<String>,
    pub revision: i32,
}

/// Tracked state of one installed package.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageState {
    pub current: Option<SideInfo>,
}

impl PackageState {
    pub fn with_declaration(package_id: impl Into<String>) -> Self {
        Self {
            current: Some(SideInfo {
                package_id: Some(package_id.into()),
                revision: 1,
            }),
        }
    }

    /// Declaration identity of the current revision, if the package has one.
    pub fn declaration_id(&self) -> Option<&str> {
        self.current
            .as_ref()
            .and_then(|si| si.package_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Device trust model.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub brand_id: String,
    pub model: String,
    /// Authoritative store, if the model names one.
    pub store: Option<String>,
}

impl Model {
    pub fn store(&self) -> Option<&str> {
        self.store.as_deref().filter(|s| !s.is_empty())
    }
}

/// Device context a refresh runs under.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceContext {
    pub model: Model,
}

impl DeviceContext {
    pub fn new(model: Model) -> Self {
        Self { model }
    }
}

/// Local user id; `0` means no user.
pub type UserId = u64;

/// Credentials the transport presents on behalf of a user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: UserId,
    pub username: String,
    pub macaroon: String,
}
