use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8081")]
    pub port: u16,

    /// Start with a few customers and products instead of empty collections.
    #[envconfig(default = "true")]
    pub seed: bool,

    /// Answer every n-th collection read with a 503. Zero disables it.
    #[envconfig(default = "0")]
    pub fail_every: u64,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
