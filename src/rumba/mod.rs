use crossbeam_channel as cch;
use std::thread;
use std::thread::JoinHandle;

use crate::midi::controller::SerialWriter;

/// G-code commands understood by the RUMBA motion controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RumbaCommand {
    Home,
    Move,
}

impl RumbaCommand {
    pub fn gcode(&self) -> &'static str {
        match self {
            RumbaCommand::Home => "G28 Z\n",
            RumbaCommand::Move => "G1 Z50\n",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("RUMBA link is closed")]
pub struct RumbaClosed;

pub struct RumbaLink {
    sender: cch::Sender<RumbaCommand>,
    _sending_loop: JoinHandle<()>,
}

impl RumbaLink {
    pub fn start<W>(mut writer: W) -> RumbaLink
    where
        W: SerialWriter + Send + 'static,
    {
        let (sender, receiver) = cch::unbounded::<RumbaCommand>();
        let _sending_loop = thread::spawn(move || {
            while let Ok(command) = receiver.recv() {
                log::info!("rumba {command:?}");
                if let Err(e) = writer.write(command.gcode().as_bytes()) {
                    log::error!("error writing to rumba controller: {e}");
                }
            }
        });

        RumbaLink {
            sender,
            _sending_loop,
        }
    }

    pub fn send(&self, command: RumbaCommand) -> Result<(), RumbaClosed> {
        self.sender.send(command).map_err(|_| RumbaClosed)
    }
}
