#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the app will bind to
    #[clap(long, env, default_value = "8095")]
    pub port: u16,

    // origin media server base url, e.g. http://emby:8096
    #[clap(long, env)]
    pub media_host: String,

    // api key created in the media server admin panel, it gets embedded into
    // the direct-link and proxy urls we hand out
    #[clap(long, env)]
    pub media_api_key: String,

    // local mount prefix under which the media server sees cloud storage
    // files, e.g. /mnt/cloud - everything below it maps 1:1 onto the
    // storage backend's logical paths
    #[clap(long, env)]
    pub mount_path: String,

    // storage listing backend base url, e.g. http://alist:5244
    #[clap(long, env)]
    pub storage_host: String,

    // token for the storage backend api
    #[clap(long, env)]
    pub storage_token: String,

    // whether to synthesize transcoded-preview media sources at all
    #[clap(long, env, default_value = "true")]
    pub preview_enabled: bool,

    // comma separated containers that are worth asking the storage backend
    // for transcoded renditions of
    #[clap(long, env, default_value = "mp4,mov,mkv")]
    pub preview_containers: String,

    // this should be either * for allowing everything, or a comma seperated list of domains like
    // example.com,something.com
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl AppConfig {
    /// case-insensitive membership check against the preview container list
    pub fn container_allowed(&self, container: &str) -> bool {
        if container.is_empty() {
            return false;
        }
        self.preview_containers
            .split(',')
            .any(|c| c.trim().eq_ignore_ascii_case(container))
    }

    /// map a media-source file path onto the storage backend's logical path
    /// by stripping the mount prefix, None when the file isn't mounted cloud
    /// storage (plain local files never get preview synthesis)
    pub fn logical_path(&self, source_path: &str) -> Option<String> {
        let rest = source_path.strip_prefix(self.mount_path.as_str())?;
        if rest.starts_with('/') {
            Some(rest.to_string())
        } else {
            Some(format!("/{}", rest))
        }
    }
}

impl Default for AppConfig {
    // defaults aren't really needed here but it's here as a bad fallback
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 8095,
            media_host: "http://localhost:8096".to_string(),
            media_api_key: "default-api-key".to_string(),
            mount_path: "/mnt/cloud".to_string(),
            storage_host: "http://localhost:5244".to_string(),
            storage_token: "default-storage-token".to_string(),
            preview_enabled: true,
            preview_containers: "mp4,mov,mkv".to_string(),
            cors_origin: "*".to_string(),
            sentry_dsn: None,
        }
    }
}
