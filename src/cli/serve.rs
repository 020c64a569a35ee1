use crate::settings::load_settings;

pub fn run(bind: Option<String>) -> anyhow::Result<()> {
    let mut settings = load_settings();
    if let Some(addr) = bind {
        settings.bind_addr = addr;
    }
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(crate::http::serve(&settings))
}
