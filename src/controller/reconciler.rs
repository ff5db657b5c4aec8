//! The observe, create, update, delete state machine
//!
//! Every pass starts from a fresh read of the desired record and a fresh
//! observation of the external resource. Nothing observed in an earlier pass
//! is trusted, so a pass can be interrupted at any point and the next one
//! picks up from the real state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::{call, operations, Lookup, ResourceAdapter};
use crate::attributes::Spec;
use crate::binder::{self, Resolution};
use crate::controller::{apply_changes, Action, Context};
use crate::error::ErrorClass;
use crate::events::{actions, reasons as event_reasons, EventType};
use crate::metrics::ReconcileTimer;
use crate::resource::{
    Condition, DeletionPolicy, ManagedResource, Phase, ResourceKey, ResourceStatus,
};
use crate::Error;

/// Reconcile one resource.
///
/// Failures are recorded on the resource's `Synced` condition before they are
/// returned; the runner then asks [`error_policy`] when to retry.
#[instrument(skip(key, ctx), fields(resource = %key))]
pub async fn reconcile(key: ResourceKey, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(key.kind.clone());

    match reconcile_pass(&key, &ctx).await {
        Ok(action) => {
            timer.success();
            Ok(action)
        }
        Err(error) => {
            timer.error(error.class());
            record_error(&key, &error, &ctx).await;
            Err(error)
        }
    }
}

/// Requeue delay after a failed pass.
///
/// `failures` is the number of consecutive failed passes, including this one.
/// Transient failures back off exponentially with jitter; terminal ones wait
/// for the slow cadence.
pub fn error_policy(key: &ResourceKey, error: &Error, failures: u32, ctx: &Context) -> Action {
    let delay = match error.class() {
        ErrorClass::Transient | ErrorClass::NotFound => {
            ctx.config.backoff.jittered_backoff_for(failures)
        }
        ErrorClass::Terminal => ctx.config.terminal_requeue,
    };

    error!(
        resource = %key,
        %error,
        class = %error.class(),
        failures,
        retry_ms = delay.as_millis() as u64,
        "reconciliation failed"
    );

    Action::requeue(delay)
}

async fn reconcile_pass(key: &ResourceKey, ctx: &Context) -> Result<Action, Error> {
    let Some(mut resource) = ctx.store.get(key).await? else {
        debug!("record no longer exists");
        return Ok(Action::await_change());
    };
    let adapter = ctx.adapters.get(&key.kind)?;

    if resource.deletion_requested {
        return reconcile_deletion(resource, adapter.as_ref(), ctx).await;
    }

    match resource.external_name.clone() {
        None => reconcile_unbound(&mut resource, adapter.as_ref(), ctx).await,
        Some(external_name) => {
            reconcile_bound(&mut resource, &external_name, adapter.as_ref(), ctx).await
        }
    }
}

/// Resolve an unbound resource: bind what already exists, or create it.
async fn reconcile_unbound(
    resource: &mut ManagedResource,
    adapter: &dyn ResourceAdapter,
    ctx: &Context,
) -> Result<Action, Error> {
    let key = resource.key.clone();
    let lookup = call(
        operations::LOOKUP,
        &key,
        ctx.config.call_timeout,
        adapter.lookup(resource),
    )
    .await?;

    match binder::resolve(lookup, resource.create_pending.is_some()) {
        Resolution::Existing(external_name) => {
            binder::bind(ctx.store.as_ref(), resource, &external_name).await?;
            ctx.events
                .publish(
                    &key,
                    EventType::Normal,
                    event_reasons::BOUND_EXISTING_RESOURCE,
                    actions::CREATE,
                    Some(format!("bound existing external resource {external_name}")),
                )
                .await;
            Ok(Action::requeue(Duration::ZERO))
        }
        Resolution::Refuse => Err(Error::CreateOutcomeUnknown {
            resource: key.to_string(),
        }),
        Resolution::Create => create(resource, adapter, ctx).await,
    }
}

async fn create(
    resource: &mut ManagedResource,
    adapter: &dyn ResourceAdapter,
    ctx: &Context,
) -> Result<Action, Error> {
    let key = resource.key.clone();

    let started = Utc::now();
    ctx.store.mark_create_pending(&key, started).await?;
    resource.create_pending = Some(started);

    info!("creating external resource");
    let created = call(
        operations::CREATE,
        &key,
        ctx.config.call_timeout,
        adapter.create(resource),
    )
    .await;

    let external_name = match created {
        Ok(external_name) => external_name,
        Err(error) => {
            // a rejected create left nothing behind; any other failure may have
            if error.class() == ErrorClass::Terminal {
                ctx.store.clear_create_pending(&key).await?;
            }
            return Err(error);
        }
    };

    binder::bind(ctx.store.as_ref(), resource, &external_name).await?;

    let mut status = resource
        .status
        .clone()
        .phase(Phase::OutOfSync)
        .message(format!("created external resource {external_name}"))
        .condition(Condition::creating());
    pass_succeeded(&mut status);
    ctx.store.update_status(&key, &status).await?;

    ctx.events
        .publish(
            &key,
            EventType::Normal,
            event_reasons::CREATED_EXTERNAL_RESOURCE,
            actions::CREATE,
            Some(format!("created external resource {external_name}")),
        )
        .await;

    Ok(Action::requeue(ctx.config.short_requeue))
}

/// Observe a bound resource, late-initialize, diff, and apply what differs.
async fn reconcile_bound(
    resource: &mut ManagedResource,
    external_name: &str,
    adapter: &dyn ResourceAdapter,
    ctx: &Context,
) -> Result<Action, Error> {
    let key = resource.key.clone();
    let observation = call(
        operations::DESCRIBE,
        &key,
        ctx.config.call_timeout,
        adapter.observe(external_name),
    )
    .await?;

    if !observation.exists {
        return Err(Error::Vanished {
            resource: key.to_string(),
            external_name: external_name.to_string(),
        });
    }

    let initialized = adapter.late_initialize(&mut resource.spec, &observation.attributes);
    if !initialized.is_empty() {
        // a user edit made since this pass read the record keeps its value
        let fields = initialized.iter().fold(Spec::new(), |fields, field_key| {
            fields.with(field_key.clone(), resource.spec.get(field_key).clone())
        });
        let written = ctx.store.fill_unset_fields(&key, &fields).await?;
        if !written.is_empty() {
            info!(fields = ?written, "late-initialized spec from observed state");
            ctx.events
                .publish(
                    &key,
                    EventType::Normal,
                    event_reasons::LATE_INITIALIZED,
                    actions::RECONCILE,
                    Some(written.join(", ")),
                )
                .await;
        }
    }

    let diff = adapter.diff(&resource.spec, &observation.attributes);
    let was_synced = resource.status.phase == Phase::Synced;
    let mut status = resource.status.clone();
    status.at_provider = observation.attributes;

    if diff.up_to_date {
        status.phase = Phase::Synced;
        status.message = Some("external resource is up to date".to_string());
        status.set_condition(Condition::available());
        pass_succeeded(&mut status);
        ctx.store.update_status(&key, &status).await?;

        if !was_synced {
            info!(%external_name, "external resource in sync");
            ctx.events
                .publish(
                    &key,
                    EventType::Normal,
                    event_reasons::SYNCED,
                    actions::RECONCILE,
                    None,
                )
                .await;
        }
        return Ok(Action::requeue(ctx.config.poll_interval));
    }

    let changed = diff.keys().join(", ");
    info!(changes = %changed, "external resource out of sync");

    let outcome = apply_changes(adapter, &key, external_name, &diff.changes, &ctx.config).await;

    status.phase = Phase::OutOfSync;
    status.message = Some(format!("updating {changed}"));
    status.set_condition(Condition::updating(format!("updating {changed}")));
    status.last_reconciled = Some(Utc::now());

    if !outcome.applied.is_empty() {
        ctx.events
            .publish(
                &key,
                EventType::Normal,
                event_reasons::UPDATED_EXTERNAL_RESOURCE,
                actions::UPDATE,
                Some(outcome.applied.join(", ")),
            )
            .await;
    }

    match outcome.into_result(&key) {
        Ok(_) => {
            pass_succeeded(&mut status);
            ctx.store.update_status(&key, &status).await?;
            Ok(Action::requeue(ctx.config.short_requeue))
        }
        Err(error) => {
            ctx.store.update_status(&key, &status).await?;
            Err(error)
        }
    }
}

/// Delete the external resource and retire the record once it is gone.
async fn reconcile_deletion(
    mut resource: ManagedResource,
    adapter: &dyn ResourceAdapter,
    ctx: &Context,
) -> Result<Action, Error> {
    let key = resource.key.clone();

    if resource.deletion_policy == DeletionPolicy::Orphan {
        info!("orphaning external resource");
        return retire(&key, ctx, "external resource orphaned").await;
    }

    let external_name = match resource.external_name.clone() {
        Some(external_name) => external_name,
        None if resource.create_pending.is_some() => {
            let lookup = call(
                operations::LOOKUP,
                &key,
                ctx.config.call_timeout,
                adapter.lookup(&resource),
            )
            .await?;
            match lookup {
                Lookup::Found(external_name) => {
                    binder::bind(ctx.store.as_ref(), &mut resource, &external_name).await?;
                    external_name
                }
                Lookup::Absent => return retire(&key, ctx, "nothing was created").await,
                Lookup::Unsupported => {
                    warn!("create outcome unknown and lookup unsupported, retiring anyway");
                    return retire(&key, ctx, "create outcome unknown").await;
                }
            }
        }
        None => return retire(&key, ctx, "nothing was created").await,
    };

    let observation = call(
        operations::DESCRIBE,
        &key,
        ctx.config.call_timeout,
        adapter.observe(&external_name),
    )
    .await?;

    if !observation.exists {
        return retire(&key, ctx, "external resource deleted").await;
    }

    info!(%external_name, "deleting external resource");
    call(
        operations::DELETE,
        &key,
        ctx.config.call_timeout,
        adapter.delete(&external_name),
    )
    .await?;

    let mut status = resource
        .status
        .clone()
        .phase(Phase::Deleting)
        .message(format!("delete of {external_name} requested"))
        .condition(Condition::deleting());
    status.at_provider = observation.attributes;
    pass_succeeded(&mut status);
    ctx.store.update_status(&key, &status).await?;

    ctx.events
        .publish(
            &key,
            EventType::Normal,
            event_reasons::DELETING_EXTERNAL_RESOURCE,
            actions::DELETE,
            Some(external_name),
        )
        .await;

    Ok(Action::requeue(ctx.config.short_requeue))
}

async fn retire(key: &ResourceKey, ctx: &Context, note: &str) -> Result<Action, Error> {
    ctx.store.retire(key).await?;
    ctx.events
        .publish(
            key,
            EventType::Normal,
            event_reasons::RETIRED,
            actions::DELETE,
            Some(note.to_string()),
        )
        .await;
    Ok(Action::await_change())
}

fn pass_succeeded(status: &mut ResourceStatus) {
    status.set_condition(Condition::reconcile_success());
    status.last_reconciled = Some(Utc::now());
}

/// Record a failed pass on the resource. Failures here are logged, never
/// returned, so the original error reaches the runner.
async fn record_error(key: &ResourceKey, error: &Error, ctx: &Context) {
    let resource = match ctx.store.get(key).await {
        Ok(Some(resource)) => resource,
        Ok(None) => return,
        Err(store_error) => {
            warn!(error = %store_error, "could not load record to report failure");
            return;
        }
    };

    let message = error.to_string();
    let mut status = resource.status;
    status.message = Some(message.clone());
    status.last_reconciled = Some(Utc::now());
    status.set_condition(Condition::reconcile_error(message.clone()));
    if matches!(error, Error::Vanished { .. }) {
        status.set_condition(Condition::unavailable(message.clone()));
    }

    if let Err(store_error) = ctx.store.update_status(key, &status).await {
        warn!(error = %store_error, "could not record failure on status");
    }

    ctx.events
        .publish(
            key,
            EventType::Warning,
            event_reasons::RECONCILE_ERROR,
            actions::RECONCILE,
            Some(message),
        )
        .await;
}
