// Copyright 2019 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

mod scenario;

use {
    anyhow::{Context, Error},
    argh::FromArgs,
    log::info,
    std::{fs, path::PathBuf},
    wlan_sap::SapConfig,
};

/// Soft-AP scenario runner.
///
/// Drives the SAP control core through a scripted sequence of host requests and lower-layer
/// indications, printing every request and notification it produces.
#[derive(FromArgs, Debug)]
struct Opt {
    /// SAP configuration (JSON)
    #[argh(option, short = 'c')]
    config: PathBuf,

    /// scenario to run (JSON)
    #[argh(option, short = 's')]
    scenario: PathBuf,

    /// file that keeps the non-occupancy list between runs
    #[argh(option)]
    nol_store: Option<PathBuf>,

    /// log debug output
    #[argh(switch, short = 'v')]
    verbose: bool,
}

fn main() -> Result<(), Error> {
    let opt: Opt = argh::from_env();
    let level =
        if opt.verbose { simplelog::LevelFilter::Debug } else { simplelog::LevelFilter::Warn };
    simplelog::SimpleLogger::init(level, simplelog::Config::default())?;

    let config = fs::read_to_string(&opt.config)
        .with_context(|| format!("reading {}", opt.config.display()))?;
    let config = SapConfig::from_json(&config)?;
    let scenario = fs::read_to_string(&opt.scenario)
        .with_context(|| format!("reading {}", opt.scenario.display()))?;
    let scenario = scenario::Scenario::from_json(&scenario)?;
    info!("Running {} steps", scenario.steps.len());

    let mut runner = scenario::Runner::new(config, &scenario, opt.nol_store)?;
    for line in runner.run(&scenario.steps)? {
        println!("{}", line);
    }
    Ok(())
}
