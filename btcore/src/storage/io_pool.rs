use std::sync::{
    mpsc::{self, channel, Receiver, Sender},
    Arc, Mutex,
};
use std::thread;

use tracing::{debug, error, info};

use super::descriptor::{DataDescriptor, DataDescriptorError};

/// Result of a storage read done on behalf of a peer request.
///
/// Lands on the requesting connection's completed-block queue; the
/// producer pass turns `Ready` into a PIECE message.
#[derive(Debug)]
pub enum BlockRead {
    Ready {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// The request asked for something we cannot serve (piece not
    /// verified, descriptor gone, bounds).
    Rejected {
        index: u32,
        begin: u32,
        length: u32,
    },
    Failed {
        index: u32,
        begin: u32,
        length: u32,
        kind: std::io::ErrorKind,
    },
}

pub enum IoMessage {
    Read {
        descriptor: Arc<DataDescriptor>,
        index: u32,
        begin: u32,
        length: u32,
        respond_to: Sender<BlockRead>,
    },
    Terminate,
}

/// Posible I/O pool errors.
#[derive(Debug)]
pub enum IoPoolError {
    MessageSendError(mpsc::SendError<IoMessage>),
}

/// Small pool of storage worker threads.
///
/// Connection workers never touch the disk for uploads; they submit a
/// read here and pick the result up from their own queue on the next
/// producer pass.
pub struct IoPool {
    workers: Vec<IoWorker>,
    sender: Sender<IoMessage>,
}

impl IoPool {
    /// Creates a new pool with `size` worker threads.
    ///
    /// If the size is zero, the `new` function will panic.
    pub fn new(size: usize) -> IoPool {
        assert!(size > 0);

        let (sender, receiver) = channel();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            workers.push(IoWorker::new(id, Arc::clone(&receiver)));
        }

        IoPool { workers, sender }
    }

    /// Queues a block read; the result is delivered to `respond_to`.
    pub fn submit_read(
        &self,
        descriptor: Arc<DataDescriptor>,
        index: u32,
        begin: u32,
        length: u32,
        respond_to: Sender<BlockRead>,
    ) -> Result<(), IoPoolError> {
        self.sender
            .send(IoMessage::Read {
                descriptor,
                index,
                begin,
                length,
                respond_to,
            })
            .map_err(IoPoolError::MessageSendError)
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            if self.sender.send(IoMessage::Terminate).is_err() {
                error!("An error occurred while attempting to drop the I/O pool.");
            }
        }

        for worker in &mut self.workers {
            info!("Shutting down I/O worker {}", worker.id);
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    error!("An error occurred while attempting to join an I/O pool thread.");
                }
            }
        }
    }
}

struct IoWorker {
    id: usize,
    thread: Option<thread::JoinHandle<()>>,
}

impl IoWorker {
    fn new(id: usize, receiver: Arc<Mutex<Receiver<IoMessage>>>) -> IoWorker {
        let thread = thread::spawn(move || loop {
            let message = match receiver.lock() {
                Ok(receiver) => receiver.recv(),
                Err(_) => break,
            };
            match message {
                Ok(IoMessage::Read {
                    descriptor,
                    index,
                    begin,
                    length,
                    respond_to,
                }) => {
                    let result = Self::read(&descriptor, index, begin, length);
                    // The requesting connection may be gone already.
                    if respond_to.send(result).is_err() {
                        debug!("I/O worker {}: requester for piece {} left", id, index);
                    }
                }
                Ok(IoMessage::Terminate) | Err(_) => break,
            }
        });

        IoWorker {
            id,
            thread: Some(thread),
        }
    }

    fn read(descriptor: &DataDescriptor, index: u32, begin: u32, length: u32) -> BlockRead {
        match descriptor.read_block(index, begin, length as usize) {
            Ok(block) => BlockRead::Ready {
                index,
                begin,
                block,
            },
            Err(DataDescriptorError::Io(err)) => BlockRead::Failed {
                index,
                begin,
                length,
                kind: err.kind(),
            },
            Err(_) => BlockRead::Rejected {
                index,
                begin,
                length,
            },
        }
    }
}
