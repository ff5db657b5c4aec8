//! External name binding
//!
//! The identifier returned by the first successful create is written into
//! the record exactly once. Until then, a lookup by the resource's
//! deterministic name decides whether it is safe to create: a create whose
//! acknowledgement was lost must be found and bound, not repeated.

use tracing::info;

use crate::adapter::Lookup;
use crate::resource::ManagedResource;
use crate::store::DesiredStore;
use crate::Error;

/// What to do with an unbound resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The resource already exists; bind this identifier
    Existing(String),
    /// Nothing exists and nothing is pending; create it
    Create,
    /// A previous create may have succeeded and cannot be verified
    Refuse,
}

/// Decide between binding, creating and refusing.
pub fn resolve(lookup: Lookup, create_pending: bool) -> Resolution {
    match lookup {
        Lookup::Found(id) => Resolution::Existing(id),
        Lookup::Absent => Resolution::Create,
        Lookup::Unsupported if create_pending => Resolution::Refuse,
        Lookup::Unsupported => Resolution::Create,
    }
}

/// Pin `external_name` on `resource` through the store.
///
/// Binding the name already bound is a no-op; binding a different one is an
/// [`Error::AlreadyBound`].
pub async fn bind(
    store: &dyn DesiredStore,
    resource: &mut ManagedResource,
    external_name: &str,
) -> Result<(), Error> {
    if let Some(existing) = &resource.external_name {
        if existing == external_name {
            return Ok(());
        }
        return Err(Error::AlreadyBound {
            resource: resource.key.to_string(),
            existing: existing.clone(),
            attempted: external_name.to_string(),
        });
    }

    store.bind_external_name(&resource.key, external_name).await?;
    resource.external_name = Some(external_name.to_string());
    resource.create_pending = None;

    info!(resource = %resource.key, external_name, "bound external name");
    Ok(())
}
