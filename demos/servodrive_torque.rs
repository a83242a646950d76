use core::time::Duration;
use etherdrive::{
    DriveMaster, Config,
    config::Timing,
    simulation::SimulatedDrive,
    };

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    // a configuration file can be given as first argument, the defaults fit most drives
    let mut config = match std::env::args().nth(1) {
        Some(path) => Config::load(path.as_ref())?,
        None => Config::default(),
        };
    // the simulated drive answers immediately
    config.timing = Timing {cycle_period: Duration::from_millis(1), .. Timing::immediate()};

    let drive = SimulatedDrive::new(1);
    let probe = drive.probe();
    println!("bring up");
    let master = DriveMaster::bring_up(drive, "sim0", config)?;
    println!("report {:#?}", master.report());

    while ! master.telemetry().enabled {
        std::thread::sleep(Duration::from_millis(1));
    }
    println!("drive enabled");

    // torque ramp up and down
    for step in (0 .. 20).chain((0 .. 20).rev()) {
        master.set_target_torque(step as f32 * 0.01);
        std::thread::sleep(Duration::from_millis(10));
        let telemetry = master.telemetry();
        println!("torque {:>4}  position {:>8}  velocity {:>10.1}  state {}  applied {}",
            telemetry.torque,
            telemetry.position,
            telemetry.velocity,
            telemetry.cia402_state,
            probe.applied_torque(1),
            );
    }
    master.set_target_torque(0.);

    println!("shutdown after {} cycles", master.telemetry().cycles);
    master.shutdown()?;
    println!("slave in {}", probe.al_state(1));
    Ok(())
}
