use crate::bridge::{HostObject, Members, ParamKind, Value};

/// Name under which every evaluation sees the logger
pub const LOGGER_NAME: &str = "log";

/// Logging object handed to scripts as `log`
///
/// `log.info("msg")` or `log.warn("msg", context)`; the context argument is
/// appended to the message. `debug` is a Rhai keyword, so scripts reach that
/// level as `log.invoke("debug", "msg")`.
#[derive(Debug, Clone)]
pub struct ScriptLogger {
    worker: String,
}

#[derive(Debug, Clone, Copy)]
enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl ScriptLogger {
    pub fn new(worker: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
        }
    }

    fn write(&self, level: Level, args: &[Value]) {
        let message = render(&args[0]);
        let line = match args.get(1) {
            Some(context) => format!("{message} {}", render(context)),
            None => message,
        };

        match level {
            Level::Debug => tracing::debug!(target: "script", worker = %self.worker, "{}", line),
            Level::Info => tracing::info!(target: "script", worker = %self.worker, "{}", line),
            Level::Warn => tracing::warn!(target: "script", worker = %self.worker, "{}", line),
            Level::Error => tracing::error!(target: "script", worker = %self.worker, "{}", line),
        }
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Str(s) => s.clone(),
        Value::List(items) => {
            let items: Vec<_> = items.iter().map(render).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Map(map) => {
            let entries: Vec<_> = map
                .iter()
                .map(|(k, v)| format!("{k}: {}", render(v)))
                .collect();
            format!("#{{{}}}", entries.join(", "))
        }
        Value::Object(object) => format!("<{}>", object.type_name()),
        Value::Handle(key) => format!("ScriptObject#{key}"),
    }
}

impl HostObject for ScriptLogger {
    const TYPE_NAME: &'static str = "ScriptLogger";

    fn members(members: &mut Members<Self>) {
        let levels = [
            ("debug", Level::Debug),
            ("info", Level::Info),
            ("log", Level::Info),
            ("warn", Level::Warn),
            ("error", Level::Error),
        ];

        for (name, level) in levels {
            members
                .action(name, &[ParamKind::Any], move |logger, args| {
                    logger.write(level, args);
                    Ok(())
                })
                .action(name, &[ParamKind::Any, ParamKind::Any], move |logger, args| {
                    logger.write(level, args);
                    Ok(())
                });
        }
    }
}
