use crate::script_api::ScriptContext;
use crate::startup_scripts::{ScriptError, StartupScript};
use serde_json::json;

/// Example startup script: mirrors the heating server and the garden
/// controller status into the local hub once startup has completed.
pub struct DefaultStartupScript;

impl StartupScript for DefaultStartupScript {
    fn uid(&self) -> &str {
        "default"
    }

    fn on_startup_completed(&self, ctx: &ScriptContext) -> Result<(), ScriptError> {
        let import_parameters = json!({
            "server": "192.168.1.16",
            "port": 1884,
            "topic": "#"
        });

        ctx.mqtt.start_topic_import("heating-server", import_parameters)?;

        let import_parameters = json!({
            "server": "192.168.1.16",
            "port": 1883,
            "topic": "garden_controller/$STATUS/#"
        });

        ctx.mqtt.start_topic_import("ha4iot-garden", import_parameters)?;

        ctx.log.info("startup script executed");
        Ok(())
    }
}
