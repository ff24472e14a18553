/// systemd unit for running the appliance at boot.
pub fn platform_template() -> &'static str {
    r#"[Unit]
Description=homewatch surveillance DVR
After=network.target local-fs.target

[Service]
ExecStart=/usr/local/bin/homewatch --config /etc/homewatch/homewatch.toml
SupplementaryGroups=video i2c
Restart=on-failure

[Install]
WantedBy=multi-user.target
"#
}

pub fn log_platform_guidance() {
    tracing::info!(
        template = platform_template(),
        "systemd service descriptor available"
    );
}
