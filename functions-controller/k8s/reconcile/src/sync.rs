//! The get-or-create-or-update protocol applied to every child resource.
//!
//! A child is looked up by its deterministic name; if absent it is built in
//! full (controller owner reference included) and created. If present it must
//! be controlled by the expected owner -- a child controlled by anyone else
//! is a conflict, never adopted or mutated. An owned child is updated only
//! when the managed sub-fields differ semantically, and the update copies the
//! retrieved object and overlays only those fields, so concurrently-written
//! fields survive and no-op passes issue no writes.

use crate::client::ClusterApi;
use functions_controller_core::{Error, Result};
use functions_controller_k8s_api::{controller_of, Function, OwnerReference, Resource};

/// The desired-state descriptor for one child resource.
pub trait ChildSpec {
    type Object: Resource + Clone + Send + Sync;

    const KIND: &'static str;

    fn namespace(&self) -> &str;
    fn name(&self) -> &str;

    /// Builds the complete object for creation.
    fn build(&self, owner: &OwnerHandle) -> Self::Object;

    /// Overlays the managed sub-fields onto a copy of `actual`, returning
    /// `None` when they are already semantically equal.
    fn overlay(&self, actual: &Self::Object) -> Option<Self::Object>;
}

/// Identifies the parent that controls a child, independent of whether the
/// parent is a function instance or the function's CRD (shared, per-kind
/// children belong to the CRD so they outlive any one function).
#[derive(Clone, Debug)]
pub struct OwnerHandle {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

impl OwnerHandle {
    pub fn controller_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    fn controls(&self, reference: &OwnerReference) -> bool {
        reference.uid == self.uid
    }
}

impl From<&Function> for OwnerHandle {
    fn from(function: &Function) -> Self {
        Self {
            api_version: function.api_version.clone(),
            kind: function.kind.clone(),
            name: function.name().to_string(),
            uid: function.uid().to_string(),
        }
    }
}

/// Resolves the child to its desired state, creating or updating as needed.
pub async fn ensure<S, A>(api: &A, owner: &OwnerHandle, desired: &S) -> Result<S::Object>
where
    S: ChildSpec,
    A: ClusterApi<S::Object> + ?Sized,
{
    let namespace = desired.namespace();
    let name = desired.name();

    let Some(actual) = api.get(namespace, name).await? else {
        return api.create(namespace, &desired.build(owner)).await;
    };

    let controlled = controller_of(actual.meta())
        .map(|reference| owner.controls(reference))
        .unwrap_or(false);
    if !controlled {
        return Err(Error::OwnerConflict {
            kind: S::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
            owner: format!("{} {}", owner.kind, owner.name),
        });
    }

    match desired.overlay(&actual) {
        Some(updated) => api.update(namespace, &updated).await,
        None => Ok(actual),
    }
}
