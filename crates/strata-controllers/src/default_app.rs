//! Default-app controller: the single writer that keeps at most one app
//! flagged `default`.
//!
//! A newly created app becomes the default when there is none. When an
//! app becomes default every other default app is cleared. Clearing the
//! flag never promotes another app.

use tracing::{debug, info};

use strata_entity::schema::App;
use strata_entity::{Entity, EntityId, EntityStore, Filter, Value, WatchEvent};
use strata_reconcile::{update_with_retry, Outcome, ReconcileResult, Reconciler};

use crate::error::ControllerResult;

/// Every app currently flagged default, ordered by id.
pub fn default_apps(store: &EntityStore) -> ControllerResult<Vec<(Entity, App)>> {
    Ok(store.list_as::<App>(&Filter::attr("app.default", Value::Bool(true)))?)
}

pub struct DefaultAppController {
    store: EntityStore,
}

impl DefaultAppController {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    fn set_default(&self, id: &EntityId, default: bool) -> ControllerResult<bool> {
        let written = update_with_retry(&self.store, id, |entity| {
            let mut app: App = entity.decode()?;
            if app.default == default {
                return Ok(false);
            }
            app.default = default;
            entity.encode(&app);
            Ok(true)
        })?;
        Ok(written.is_some())
    }

    /// Converge after a change to `entity`.
    pub fn converge(&self, entity: &Entity) -> ControllerResult<()> {
        let app: App = entity.decode()?;
        let defaults = default_apps(&self.store)?;

        if app.default {
            for (other, _) in defaults.iter().filter(|(other, _)| other.id != entity.id) {
                if self.set_default(&other.id, false)? {
                    info!(app = %other.id, new_default = %entity.id, "default flag cleared");
                }
            }
            return Ok(());
        }

        // Only the first write of an id counts as creation.
        let created = entity.revision == 1;
        if created && defaults.is_empty() && self.set_default(&entity.id, true)? {
            info!(app = %entity.id, "first app promoted to default");
        } else {
            debug!(app = %entity.id, "default flag unchanged");
        }
        Ok(())
    }
}

impl Reconciler for DefaultAppController {
    fn name(&self) -> &'static str {
        "default_app"
    }

    fn filter(&self) -> Filter {
        Filter::kind("app")
    }

    async fn reconcile(&self, event: &WatchEvent) -> ReconcileResult<Outcome> {
        if event.is_delete() {
            return Ok(Outcome::Done);
        }
        match self.converge(&event.entity) {
            Ok(()) => Ok(Outcome::Done),
            Err(e) if e.is_not_found() => Ok(Outcome::Done),
            Err(e) => Err(e.into()),
        }
    }
}
