//! Default-route controller: keeps `http_route/default` pointing at the
//! default app, and removes it when there is none.

use tracing::info;

use strata_entity::schema::HttpRoute;
use strata_entity::{Entity, EntityId, EntityResult, EntityStore, Filter, WatchEvent};
use strata_reconcile::{update_with_retry, Outcome, ReconcileResult, Reconciler};

use crate::default_app::default_apps;
use crate::error::ControllerResult;

/// Name of the catch-all route.
pub const DEFAULT_ROUTE: &str = "default";

/// Host recorded on the catch-all route.
pub const DEFAULT_ROUTE_HOST: &str = "*";

pub fn default_route_id() -> EntityResult<EntityId> {
    EntityId::new("http_route", DEFAULT_ROUTE)
}

pub struct DefaultRouteController {
    store: EntityStore,
    route: EntityId,
}

impl DefaultRouteController {
    pub fn new(store: EntityStore) -> ControllerResult<Self> {
        Ok(Self {
            store,
            route: default_route_id()?,
        })
    }

    /// Point the default route at the current default app.
    pub fn converge(&self) -> ControllerResult<()> {
        let target = default_apps(&self.store)?.into_iter().next().map(|(e, _)| e.id);
        let current = self.store.try_get(&self.route)?;

        match (target, current) {
            (None, None) => {}
            (None, Some(route)) => match self.store.delete(&self.route, Some(route.revision)) {
                Ok(_) => info!("default route removed"),
                Err(e) if e.is_conflict() || e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            },
            (Some(app), None) => {
                let route = HttpRoute {
                    host: DEFAULT_ROUTE_HOST.to_string(),
                    app: app.clone(),
                    default: true,
                };
                match self.store.create(&Entity::from_schema(self.route.clone(), &route)?) {
                    Ok(_) => info!(%app, "default route created"),
                    Err(e) if e.is_conflict() => return self.converge(),
                    Err(e) => return Err(e.into()),
                }
            }
            (Some(app), Some(_)) => {
                let written = update_with_retry(&self.store, &self.route, |entity| {
                    let mut route: HttpRoute = entity.decode()?;
                    if route.app == app && route.default {
                        return Ok(false);
                    }
                    route.app = app.clone();
                    route.default = true;
                    entity.encode(&route);
                    Ok(true)
                })?;
                if written.is_some() {
                    info!(%app, "default route repointed");
                }
            }
        }
        Ok(())
    }
}

impl Reconciler for DefaultRouteController {
    fn name(&self) -> &'static str {
        "default_route"
    }

    fn filter(&self) -> Filter {
        Filter::kind("app")
    }

    async fn reconcile(&self, _event: &WatchEvent) -> ReconcileResult<Outcome> {
        self.converge()?;
        Ok(Outcome::Done)
    }
}
