//! OpenAPI export command.

use clap::Args;
use std::fs;
use std::path::PathBuf;
use utoipa::OpenApi;

use sandboxd::api::ApiDoc;
use sandboxd::Error;

/// Export the OpenAPI document as JSON.
#[derive(Args, Debug)]
pub struct OpenapiCmd {
    /// Output file path (defaults to stdout).
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl OpenapiCmd {
    pub fn run(&self) -> sandboxd::Result<()> {
        let output = ApiDoc::openapi()
            .to_pretty_json()
            .map_err(|e| Error::config("serialize OpenAPI", e.to_string()))?;

        match &self.output {
            Some(path) => {
                fs::write(path, &output).map_err(|e| {
                    Error::config(format!("write {}", path.display()), e.to_string())
                })?;
                eprintln!("OpenAPI document written to {}", path.display());
            }
            None => println!("{}", output),
        }

        Ok(())
    }
}
