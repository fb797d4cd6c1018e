//! Volume operation dispatch: single-service task wrappers and the
//! multi-service fan-out aggregator.
//!
//! Multi-service operations schedule one task per registered service (each
//! bound to a context derived via
//! [`Context::with_storage_service`](crate::context::Context::with_storage_service))
//! plus one aggregator task that waits for the whole batch and merges
//! per-service results into a map keyed by service name.  Failures never
//! discard successful partial results: the aggregator records them next to
//! the surfaced error inside a [`BatchError`].
//!
//! Per-service tasks are inspected in lexicographic service-name order, so
//! when several services fail the surfaced error is deterministically that
//! of the first failing service by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::context::Context;
use crate::error::{BatchError, StorError};
use crate::service::{ServiceRegistry, StorageService};
use crate::task::{Task, TaskValidator};
use crate::types::{
    ServiceVolumeMap, VolumeAttachOpts, VolumeAttachResponse, VolumeCreateOpts, VolumeDetachOpts,
    VolumeInspectOpts, VolumeMap, VolumesOpts,
};

/// List volumes across every registered service.
///
/// One task per service lists that backend's volumes as a [`VolumeMap`];
/// the returned aggregator task waits for all of them and merges the maps
/// into a [`ServiceVolumeMap`].  `service_validator` is applied to each
/// per-service result, `validator` to the merged result.
pub fn volumes(
    registry: &ServiceRegistry,
    ctx: &Context,
    opts: VolumesOpts,
    service_validator: Option<TaskValidator>,
    validator: Option<TaskValidator>,
) -> Arc<Task> {
    let mut tasks = BTreeMap::new();

    for svc in registry.services() {
        let opts = opts.clone();
        let task = svc.task_execute(
            ctx,
            move |ctx, svc| async move {
                let ctx = ctx.with_storage_service(svc.clone());
                let map = list_volumes(&ctx, &svc, &opts).await?;
                serde_json::to_value(&map).map_err(StorError::internal)
            },
            service_validator.clone(),
        );
        tasks.insert(svc.name().to_owned(), task);
    }

    aggregate(registry, ctx, tasks, validator)
}

/// List volumes for the service bound to `ctx`.
pub fn volumes_for_service(
    ctx: &Context,
    opts: VolumesOpts,
    validator: Option<TaskValidator>,
) -> Arc<Task> {
    let service = ctx.must_service();
    service.task_execute(
        ctx,
        move |ctx, svc| async move {
            let map = list_volumes(&ctx, &svc, &opts).await?;
            serde_json::to_value(&map).map_err(StorError::internal)
        },
        validator,
    )
}

/// Inspect one volume on the service bound to `ctx`.
///
/// With `opts.by_name` the volume is located by (case-insensitive) name in
/// the backend's listing; otherwise the driver inspects by identifier.
pub fn volume_inspect(
    ctx: &Context,
    volume_id: &str,
    opts: VolumeInspectOpts,
    validator: Option<TaskValidator>,
) -> Result<Arc<Task>, StorError> {
    let service = ctx.must_service();
    if opts.attachments && ctx.instance_id().is_none() {
        return Err(StorError::MissingInstanceId(service.name().to_owned()));
    }

    let volume_id = volume_id.to_owned();
    let task = if opts.by_name {
        service.task_execute(
            ctx,
            move |ctx, svc| async move {
                let list_opts = VolumesOpts {
                    attachments: opts.attachments,
                    name_eq: None,
                    opts: opts.opts.clone(),
                };
                let vols = svc.driver().volumes(&ctx, &list_opts).await?;
                let want = volume_id.to_lowercase();
                for vol in vols {
                    if vol.name.to_lowercase() == want {
                        return serde_json::to_value(&vol).map_err(StorError::internal);
                    }
                }
                Err(StorError::NotFound(volume_id))
            },
            validator,
        )
    } else {
        service.task_execute(
            ctx,
            move |ctx, svc| async move {
                let vol = svc.driver().volume_inspect(&ctx, &volume_id, &opts).await?;
                serde_json::to_value(&vol).map_err(StorError::internal)
            },
            validator,
        )
    };

    Ok(task)
}

/// Create a volume on the service bound to `ctx`.
pub fn volume_create(
    ctx: &Context,
    name: &str,
    opts: VolumeCreateOpts,
    validator: Option<TaskValidator>,
) -> Arc<Task> {
    let service = ctx.must_service();
    let name = name.to_owned();
    service.task_execute(
        ctx,
        move |ctx, svc| async move {
            let vol = svc.driver().volume_create(&ctx, &name, &opts).await?;
            serde_json::to_value(&vol).map_err(StorError::internal)
        },
        validator,
    )
}

/// Copy a volume on the service bound to `ctx`.
pub fn volume_copy(
    ctx: &Context,
    volume_id: &str,
    volume_name: &str,
    validator: Option<TaskValidator>,
) -> Arc<Task> {
    let service = ctx.must_service();
    let volume_id = volume_id.to_owned();
    let volume_name = volume_name.to_owned();
    service.task_execute(
        ctx,
        move |ctx, svc| async move {
            let vol = svc
                .driver()
                .volume_copy(&ctx, &volume_id, &volume_name)
                .await?;
            serde_json::to_value(&vol).map_err(StorError::internal)
        },
        validator,
    )
}

/// Snapshot a volume on the service bound to `ctx`.
pub fn volume_snapshot(
    ctx: &Context,
    volume_id: &str,
    snapshot_name: &str,
    validator: Option<TaskValidator>,
) -> Arc<Task> {
    let service = ctx.must_service();
    let volume_id = volume_id.to_owned();
    let snapshot_name = snapshot_name.to_owned();
    service.task_execute(
        ctx,
        move |ctx, svc| async move {
            let snap = svc
                .driver()
                .volume_snapshot(&ctx, &volume_id, &snapshot_name)
                .await?;
            serde_json::to_value(&snap).map_err(StorError::internal)
        },
        validator,
    )
}

/// Attach a volume to the context's instance on the service bound to `ctx`.
///
/// Fails up front with [`StorError::MissingInstanceId`] when the chain
/// carries no instance identity.
pub fn volume_attach(
    ctx: &Context,
    volume_id: &str,
    opts: VolumeAttachOpts,
    validator: Option<TaskValidator>,
) -> Result<Arc<Task>, StorError> {
    let service = ctx.must_service();
    if ctx.instance_id().is_none() {
        return Err(StorError::MissingInstanceId(service.name().to_owned()));
    }

    let volume_id = volume_id.to_owned();
    Ok(service.task_execute(
        ctx,
        move |ctx, svc| async move {
            let (volume, attach_token) =
                svc.driver().volume_attach(&ctx, &volume_id, &opts).await?;
            let reply = VolumeAttachResponse {
                volume,
                attach_token,
            };
            serde_json::to_value(&reply).map_err(StorError::internal)
        },
        validator,
    ))
}

/// Detach a volume from the context's instance on the service bound to
/// `ctx`.
pub fn volume_detach(
    ctx: &Context,
    volume_id: &str,
    opts: VolumeDetachOpts,
    validator: Option<TaskValidator>,
) -> Result<Arc<Task>, StorError> {
    let service = ctx.must_service();
    if ctx.instance_id().is_none() {
        return Err(StorError::MissingInstanceId(service.name().to_owned()));
    }

    let volume_id = volume_id.to_owned();
    Ok(service.task_execute(
        ctx,
        move |ctx, svc| async move {
            let vol = svc.driver().volume_detach(&ctx, &volume_id, &opts).await?;
            serde_json::to_value(&vol).map_err(StorError::internal)
        },
        validator,
    ))
}

/// Detach every volume on every registered service.
///
/// Composes two aggregation passes: each per-service task enumerates that
/// backend's volumes and detaches them one by one, returning the detached
/// set as its result; the aggregator merges those sets per service.  A
/// per-service task that fails mid-teardown reports the volumes it did
/// detach through a [`BatchError`], and the aggregator folds them into the
/// merged reply before surfacing the failure.
pub fn volume_detach_all(
    registry: &ServiceRegistry,
    ctx: &Context,
    opts: VolumeDetachOpts,
    validator: Option<TaskValidator>,
) -> Arc<Task> {
    let mut tasks = BTreeMap::new();

    for svc in registry.services() {
        let opts = opts.clone();
        let task = svc.task_execute(
            ctx,
            move |ctx, svc| async move {
                let ctx = ctx.with_storage_service(svc.clone());
                if ctx.instance_id().is_none() {
                    return Err(StorError::MissingInstanceId(svc.name().to_owned()));
                }
                detach_all_volumes(&ctx, &svc, &opts).await
            },
            None,
        );
        tasks.insert(svc.name().to_owned(), task);
    }

    aggregate(registry, ctx, tasks, validator)
}

/// Detach every volume on the service bound to `ctx`.
pub fn volume_detach_all_for_service(
    ctx: &Context,
    opts: VolumeDetachOpts,
    validator: Option<TaskValidator>,
) -> Result<Arc<Task>, StorError> {
    let service = ctx.must_service();
    if ctx.instance_id().is_none() {
        return Err(StorError::MissingInstanceId(service.name().to_owned()));
    }

    Ok(service.task_execute(
        ctx,
        move |ctx, svc| async move { detach_all_volumes(&ctx, &svc, &opts).await },
        validator,
    ))
}

/// Remove a volume on the service bound to `ctx`.
pub fn volume_remove(
    ctx: &Context,
    volume_id: &str,
    validator: Option<TaskValidator>,
) -> Arc<Task> {
    let service = ctx.must_service();
    let volume_id = volume_id.to_owned();
    service.task_execute(
        ctx,
        move |ctx, svc| async move {
            svc.driver().volume_remove(&ctx, &volume_id).await?;
            Ok(Value::Null)
        },
        validator,
    )
}

/// Schedule the aggregator task for a batch of per-service tasks.
///
/// The aggregator waits for the whole batch, merges every successful
/// per-service [`VolumeMap`] into a [`ServiceVolumeMap`], and surfaces the
/// first failure (in service-name order) as a [`BatchError`] that carries
/// the merged partial results.
fn aggregate(
    registry: &ServiceRegistry,
    ctx: &Context,
    tasks: BTreeMap<String, Arc<Task>>,
    validator: Option<TaskValidator>,
) -> Arc<Task> {
    let ids: Vec<_> = tasks.values().map(|t| t.id()).collect();
    let tracker = registry.tracker().clone();

    registry.task_execute(
        ctx,
        move |ctx| async move {
            tracker.wait_all(&ids).await;

            let mut reply = ServiceVolumeMap::new();
            let mut first_error: Option<StorError> = None;

            for (name, task) in &tasks {
                if let Some(err) = task.error() {
                    ctx.debug(format!("service {name}: task {} failed: {err}", task.id()));
                    let err = match err {
                        // A failed teardown still reports the volumes it
                        // got through; keep them in the merged reply.
                        StorError::Batch(batch) => {
                            if let Ok(map) =
                                serde_json::from_value::<VolumeMap>(batch.completed.clone())
                            {
                                if !map.is_empty() {
                                    reply.insert(name.clone(), map);
                                }
                            }
                            *batch.source
                        }
                        other => other,
                    };
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    continue;
                }

                let result = task.result().unwrap_or(Value::Null);
                match serde_json::from_value::<VolumeMap>(result) {
                    Ok(map) => {
                        reply.insert(name.clone(), map);
                    }
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(StorError::ResultShape(format!(
                                "service {name}: expected volume map: {e}"
                            )));
                        }
                    }
                }
            }

            match first_error {
                Some(err) => Err(StorError::Batch(BatchError::new(&reply, err))),
                None => serde_json::to_value(&reply).map_err(StorError::internal),
            }
        },
        validator,
    )
}

/// List a service's volumes as a map, applying the name-equality filter and
/// narrowing attachments down to the context's instance when requested.
async fn list_volumes(
    ctx: &Context,
    svc: &Arc<StorageService>,
    opts: &VolumesOpts,
) -> Result<VolumeMap, StorError> {
    let iid = ctx.instance_id();
    if opts.attachments && iid.is_none() {
        return Err(StorError::MissingInstanceId(svc.name().to_owned()));
    }

    let volumes = svc.driver().volumes(ctx, opts).await?;
    let lcase_iid = iid.map(|i| i.id.to_lowercase());
    let lcase_name = opts.name_eq.as_deref().map(str::to_lowercase);

    let mut map = VolumeMap::new();
    for mut volume in volumes {
        if let Some(want) = &lcase_name {
            if volume.name.to_lowercase() != *want {
                continue;
            }
        }
        if opts.attachments {
            volume
                .attachments
                .retain(|a| Some(a.instance_id.id.to_lowercase()) == lcase_iid);
            if volume.attachments.is_empty() {
                continue;
            }
        }
        map.insert(volume.id.clone(), volume);
    }

    Ok(map)
}

/// Detach every volume the service currently reports, collecting the
/// detached volumes; a mid-teardown failure is wrapped in a [`BatchError`]
/// that preserves the volumes detached so far.
async fn detach_all_volumes(
    ctx: &Context,
    svc: &Arc<StorageService>,
    opts: &VolumeDetachOpts,
) -> Result<Value, StorError> {
    let driver = svc.driver();
    let list_opts = VolumesOpts {
        attachments: false,
        name_eq: None,
        opts: opts.opts.clone(),
    };
    let volumes = driver.volumes(ctx, &list_opts).await?;

    let mut detached = VolumeMap::new();
    for volume in volumes {
        match driver.volume_detach(ctx, &volume.id, opts).await {
            Ok(vol) => {
                detached.insert(vol.id.clone(), vol);
            }
            Err(err) => return Err(StorError::Batch(BatchError::new(&detached, err))),
        }
    }

    serde_json::to_value(&detached).map_err(StorError::internal)
}
