//! Shared fixtures for the integration tests
//!
//! Archives are built in memory with the `zip` writer so every test owns
//! exactly the rows it asserts on.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use cnpj_server::ingest::EtlConfig;

/// ZIP holding `entries` as `(inner file name, content)` pairs
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

pub fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
    std::fs::write(path, zip_bytes(entries)).unwrap();
}

/// Two CNAE rows, Latin-1 encoded
pub fn cnae_archive() -> Vec<u8> {
    zip_bytes(&[(
        "F.K03200$Z.D40511.CNAECSV",
        b"\"0111301\";\"Cultivo de arroz\"\n\"0111302\";\"Cultivo de milho\"\n",
    )])
}

/// One establishment with only the three CNPJ parts filled in
pub fn establishment_archive() -> Vec<u8> {
    let mut row = String::from("\"12345678\";\"0001\";\"90\"");
    for _ in 3..30 {
        row.push_str(";\"\"");
    }
    row.push('\n');
    zip_bytes(&[("K3241.K03200Y0.D40511.ESTABELE", row.as_bytes())])
}

pub fn empresa_archive() -> Vec<u8> {
    zip_bytes(&[(
        "K3241.K03200Y0.D40511.EMPRECSV",
        b"\"12345678\";\"EMPRESA EXEMPLO LTDA\";\"2062\";\"49\";\"1000,00\";\"01\";\"\"\n",
    )])
}

/// Pipeline config rooted in a scratch directory, pointed at `base_url`
pub fn test_config(root: &Path, base_url: &str) -> EtlConfig {
    let data_dir: PathBuf = root.join("data");
    EtlConfig {
        base_url: base_url.to_string(),
        scratch_dir: data_dir.join("extracted"),
        staging_dir: data_dir.join("staging"),
        data_dir,
        batch_size: 1000,
        min_free_gb: 0.0,
        recommended_free_gb: 0.0,
        http_timeout_secs: 5,
        download_timeout_secs: 10,
        connect_timeout_secs: 5,
        ..EtlConfig::default()
    }
}

/// Apache-style index page linking every name in `links`
pub fn listing(links: &[&str]) -> String {
    let mut html = String::from("<html><body><pre>\n<a href=\"../\">Parent Directory</a>\n");
    for link in links {
        html.push_str(&format!("<a href=\"{link}\">{link}</a>\n"));
    }
    html.push_str("</pre></body></html>");
    html
}
