//! In-order command queue.
//!
//! Commands run one after the other on a dedicated worker thread. Each
//! enqueued command gets an [`Event`], signaled once it has run.
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use kestrel_core::internal::*;
use parking_lot::{Condvar, Mutex};

type Command = Box<dyn FnOnce() -> KestrelResult<()> + Send>;

#[derive(Default)]
struct EventState {
    status: Mutex<Option<Result<(), String>>>,
    done: Condvar,
}

/// Completion marker of an enqueued command.
#[derive(Clone, Default)]
pub struct Event(Arc<EventState>);

impl Event {
    /// An event with nothing to wait for.
    pub fn complete() -> Event {
        let event = Event::default();
        event.signal(Ok(()));
        event
    }

    fn signal(&self, status: Result<(), String>) {
        *self.0.status.lock() = Some(status);
        self.0.done.notify_all();
    }

    pub fn is_complete(&self) -> bool {
        self.0.status.lock().is_some()
    }

    /// Block until the command ran, and report its failure if any.
    pub fn wait(&self) -> KestrelResult<()> {
        let mut status = self.0.status.lock();
        while status.is_none() {
            self.0.done.wait(&mut status);
        }
        match status.as_ref() {
            Some(Err(e)) => bail!("Device command failed: {}", e),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &*self.0.status.lock() {
            None => write!(f, "Event(pending)"),
            Some(Ok(())) => write!(f, "Event(complete)"),
            Some(Err(e)) => write!(f, "Event(failed: {e})"),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

pub struct CommandQueue {
    name: String,
    sender: Mutex<Option<mpsc::Sender<(String, Command, Event)>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last: Mutex<Event>,
}

impl CommandQueue {
    pub fn new(name: impl Into<String>) -> KestrelResult<CommandQueue> {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<(String, Command, Event)>();
        let worker = std::thread::Builder::new()
            .name(format!("{name}-queue"))
            .spawn(move || {
                for (label, command, event) in receiver {
                    let status = match panic::catch_unwind(AssertUnwindSafe(command)) {
                        Ok(status) => status.map_err(|e| format!("{label}: {e:?}")),
                        Err(payload) => Err(format!("{label} panicked: {}", panic_message(&*payload))),
                    };
                    if let Err(e) = &status {
                        log::error!("{}", e);
                    }
                    event.signal(status);
                }
            })
            .with_context(|| format!("Spawning the {name} queue worker"))?;
        Ok(CommandQueue {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            last: Mutex::new(Event::complete()),
        })
    }

    pub fn enqueue(
        &self,
        label: impl Into<String>,
        command: impl FnOnce() -> KestrelResult<()> + Send + 'static,
    ) -> KestrelResult<Event> {
        let label = label.into();
        let event = Event::default();
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else { bail!("{} queue is shut down", self.name) };
        log::trace!("{} enqueues {}", self.name, label);
        sender
            .send((label, Box::new(command), event.clone()))
            .map_err(|_| anyhow!("{} queue worker is gone", self.name))?;
        *self.last.lock() = event.clone();
        Ok(event)
    }

    /// Wait for every command enqueued so far.
    pub fn finish(&self) -> KestrelResult<()> {
        let last = self.last.lock().clone();
        last.wait()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CommandQueue({})", self.name)
    }
}

impl Drop for CommandQueue {
    fn drop(&mut self) {
        self.sender.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                log::error!("{} queue worker panicked", self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn commands_run_in_order() {
        let queue = CommandQueue::new("test").unwrap();
        let trace = Arc::new(Mutex::new(vec![]));
        let events: Vec<Event> = (0..16)
            .map(|i| {
                let trace = trace.clone();
                queue
                    .enqueue(format!("push {i}"), move || {
                        trace.lock().push(i);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();
        events[15].wait().unwrap();
        assert!(events.iter().all(Event::is_complete));
        assert_eq!(*trace.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn failures_reach_the_waiter_only() {
        let queue = CommandQueue::new("test").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let failed = queue.enqueue("fail", || bail!("out of resources")).unwrap();
        let counter = ran.clone();
        let next = queue
            .enqueue("next", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert!(format!("{:?}", failed.wait().unwrap_err()).contains("out of resources"));
        next.wait().unwrap();
        queue.finish().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_command_fails_its_event() {
        let queue = CommandQueue::new("test").unwrap();
        let crashed = queue.enqueue("crash", || panic!("kernel overran its buffer")).unwrap();
        let err = crashed.wait().unwrap_err();
        assert!(format!("{err:?}").contains("kernel overran its buffer"));
        let next = queue.enqueue("next", || Ok(())).unwrap();
        next.wait().unwrap();
        queue.finish().unwrap();
    }
}
