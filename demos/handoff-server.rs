// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::phttp::{
    BackendPool,
    Config,
    Fail,
    HandoffTarget,
    HttpServer,
    Request,
    Response,
    ServerConfig,
    STATUS_HANDOFF,
};
use ::std::env;

//======================================================================================================================
// usage()
//======================================================================================================================

/// Prints program usage and exits.
fn usage(program_name: &String) {
    println!("Usage: {} <config file> [front]", program_name);
    println!("Modes:");
    println!("  front    answer every fresh request with a handoff to the next backend");
    println!("  (none)   serve requests locally, including imported ones");
}

//======================================================================================================================
// main()
//======================================================================================================================

pub fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage(&args[0]);
        anyhow::bail!("missing config file");
    }
    let config: Config = Config::new(&args[1])?;
    let front: bool = args.len() > 2 && args[2] == "front";

    let mut pool: BackendPool = BackendPool::new(config.backends()?);
    let handler = move |req: &Request, res: &mut Response, imported: bool| -> Result<(), Fail> {
        // A front end passes every fresh connection to a backend; a backend
        // serves whatever reaches it.
        if front && !imported {
            if let Some(addr) = pool.select() {
                res.set_status(STATUS_HANDOFF, "Handoff");
                res.handoff = Some(HandoffTarget { addr });
                return Ok(());
            }
        }
        res.set_status(200, "OK");
        res.add_header("Content-Type", "text/plain")?;
        res.body.push(b"hello from ");
        res.body.push(req.path());
        res.body.push(b"\n");
        Ok(())
    };

    let server_config: ServerConfig = ServerConfig::from_config(&config)?;
    let mut server: HttpServer<_> = HttpServer::new(server_config, handler, None)?;
    server.run()?;
    Ok(())
}
