use crate::config::Config;
use crate::lifecycle::LifecycleListener;
use crate::script_api::{ApiError, LogApi, MqttApi, ScriptContext, TracingLog};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{0}")]
    Failed(String),
}

/// A user script bound to the host lifecycle. Hooks a script does not
/// override do nothing.
pub trait StartupScript: Send + Sync {
    fn uid(&self) -> &str;

    fn initialize(&self, _ctx: &ScriptContext) -> Result<(), ScriptError> {
        Ok(())
    }

    fn on_services_initialized(&self, _ctx: &ScriptContext) -> Result<(), ScriptError> {
        Ok(())
    }

    fn on_configuration_loaded(&self, _ctx: &ScriptContext) -> Result<(), ScriptError> {
        Ok(())
    }

    fn on_startup_completed(&self, _ctx: &ScriptContext) -> Result<(), ScriptError> {
        Ok(())
    }

    fn on_shutdown(&self, _ctx: &ScriptContext) -> Result<(), ScriptError> {
        Ok(())
    }
}

/// Factory for the per-script `log` collaborator.
pub type LogFactory = Box<dyn Fn(&str) -> Arc<dyn LogApi> + Send + Sync>;

struct StartupScriptInstance {
    script: Arc<dyn StartupScript>,
    context: ScriptContext,
}

pub struct StartupScriptsService {
    registered: Mutex<Vec<Arc<dyn StartupScript>>>,
    scripts: Mutex<Vec<StartupScriptInstance>>,
    mqtt: Arc<dyn MqttApi>,
    log_factory: LogFactory,
    config: Config,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StartupScriptsService {
    pub fn new(mqtt: Arc<dyn MqttApi>, config: Config) -> Arc<Self> {
        Self::with_log_factory(
            mqtt,
            config,
            Box::new(|uid: &str| Arc::new(TracingLog::new(uid)) as Arc<dyn LogApi>),
        )
    }

    pub fn with_log_factory(mqtt: Arc<dyn MqttApi>, config: Config, log_factory: LogFactory) -> Arc<Self> {
        Arc::new(Self {
            registered: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            mqtt,
            log_factory,
            config,
        })
    }

    pub fn register(&self, script: Arc<dyn StartupScript>) {
        lock(&self.registered).push(script);
    }

    pub fn startup_script_uids(&self) -> Vec<String> {
        lock(&self.registered)
            .iter()
            .map(|s| s.uid().to_string())
            .collect()
    }

    /// Uids of the scripts that passed initialization.
    pub fn active_scripts(&self) -> Vec<String> {
        lock(&self.scripts)
            .iter()
            .map(|i| i.script.uid().to_string())
            .collect()
    }

    pub fn start(&self) {
        let registered: Vec<Arc<dyn StartupScript>> = lock(&self.registered).clone();
        for script in registered {
            self.try_initialize_startup_script(script);
        }
    }

    fn try_initialize_startup_script(&self, script: Arc<dyn StartupScript>) {
        let uid = script.uid().to_string();

        if !self.config.is_startup_script_enabled(&uid) {
            info!("Startup script '{}' not executed because it is disabled.", uid);
            return;
        }

        info!("Initializing startup script '{}'.", uid);
        let context = ScriptContext::new(self.mqtt.clone(), (self.log_factory)(&uid));

        if let Err(e) = script.initialize(&context) {
            error!("Error while initializing startup script '{}': {}", uid, e);
            return;
        }

        info!("Startup script '{}' initialized.", uid);
        lock(&self.scripts).push(StartupScriptInstance { script, context });
    }

    fn try_execute_function<F>(&self, function_name: &str, function: F)
    where
        F: Fn(&dyn StartupScript, &ScriptContext) -> Result<(), ScriptError>,
    {
        let scripts = lock(&self.scripts);
        for instance in scripts.iter() {
            if let Err(e) = function(instance.script.as_ref(), &instance.context) {
                error!(
                    "Error while executing function '{}' of startup script '{}': {}",
                    function_name,
                    instance.script.uid(),
                    e
                );
            }
        }
    }
}

impl LifecycleListener for StartupScriptsService {
    fn on_services_initialized(&self) {
        self.try_execute_function("on_services_initialized", |s, ctx| s.on_services_initialized(ctx));
    }

    fn on_configuration_loaded(&self) {
        self.try_execute_function("on_configuration_loaded", |s, ctx| s.on_configuration_loaded(ctx));
    }

    fn on_startup_completed(&self) {
        self.try_execute_function("on_startup_completed", |s, ctx| s.on_startup_completed(ctx));
    }

    fn on_shutdown(&self) {
        self.try_execute_function("on_shutdown", |s, ctx| s.on_shutdown(ctx));
    }
}
