mod settings;

pub use self::settings::{config, load_config, BackendEndpoint, DriverKind, Settings, Tunables};
