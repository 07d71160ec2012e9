use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use url::Url;

use crate::task::{Task, TaskId};

/// Cola FIFO compartida entre etapas. Sacar una tarea de acá transfiere su dueño.
#[derive(Clone, Default)]
pub struct TaskQueue {
    inner: Arc<Mutex<VecDeque<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Task>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, task: Task) {
        self.lock().push_back(task);
    }

    /// No bloquea: `None` si está vacía.
    pub fn try_pop(&self) -> Option<Task> {
        self.lock().pop_front()
    }

    /// Saca todo lo que hay en este momento.
    pub fn drain(&self) -> Vec<Task> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Qué se sabe de una tarea que otra puede usar como origen de datos.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerState {
    /// Agendada, todavía sin terminar. Guarda su directorio de trabajo.
    Scheduled(Url),
    Done(Url),
    Failed,
}

/// Las cinco colas de una asignación más la contabilidad de lo que está en curso.
#[derive(Default)]
pub(crate) struct Pipeline {
    pub input: TaskQueue,
    pub exec_ready: TaskQueue,
    pub output: TaskQueue,
    pub done: TaskQueue,
    pub failed: TaskQueue,

    // tareas admitidas que todavía no llegaron a done/failed
    outstanding: AtomicUsize,
    producers: Mutex<HashMap<TaskId, ProducerState>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    fn board(&self) -> MutexGuard<'_, HashMap<TaskId, ProducerState>> {
        self.producers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Anota la tarea en el tablero de productores. Se hace para todo el lote
    /// antes de encolar, así el orden dentro del lote no importa.
    pub fn register(&self, task: &Task) {
        if let Some(wd) = task.workdir_url() {
            self.board().insert(task.id(), ProducerState::Scheduled(wd));
        }
    }

    pub fn producer(&self, id: &TaskId) -> Option<ProducerState> {
        self.board().get(id).cloned()
    }

    /// Entra al pipeline por la cola de entrada.
    pub fn admit(&self, task: Task) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.input.push(task);
    }

    /// Una tarea que nunca fue admitida pero igual debe quedar en `failed`.
    pub fn reject(&self, task: Task) {
        self.failed.push(task);
    }

    pub fn finish_done(&self, task: Task) {
        if let Some(wd) = task.workdir_url() {
            self.board().insert(task.id(), ProducerState::Done(wd));
        }
        self.done.push(task);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn finish_failed(&self, task: Task) {
        self.board().insert(task.id(), ProducerState::Failed);
        self.failed.push(task);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduled(name: &str) -> Task {
        let mut t = Task::new(name, "/bin/true");
        t.assign_remote_workdir(Url::parse("file:///scratch/bja/").unwrap())
            .unwrap();
        t
    }

    #[test]
    fn cola_es_fifo() {
        let q = TaskQueue::new();
        q.push(Task::new("a", "/bin/true"));
        q.push(Task::new("b", "/bin/true"));

        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop().unwrap().name(), "a");
        assert_eq!(q.try_pop().unwrap().name(), "b");
        assert!(q.try_pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn pipeline_cuenta_lo_que_esta_en_curso() {
        let p = Pipeline::new();
        p.admit(scheduled("a"));
        p.admit(scheduled("b"));
        assert_eq!(p.outstanding(), 2);

        let a = p.input.try_pop().unwrap();
        p.finish_done(a);
        let b = p.input.try_pop().unwrap();
        p.finish_failed(b);

        assert_eq!(p.outstanding(), 0);
        assert_eq!(p.done.len(), 1);
        assert_eq!(p.failed.len(), 1);
    }

    #[test]
    fn tablero_sigue_al_productor() {
        let p = Pipeline::new();
        let t = scheduled("producer");
        let id = t.id();
        let wd = t.workdir_url().unwrap();

        assert_eq!(p.producer(&id), None);
        p.register(&t);
        assert_eq!(p.producer(&id), Some(ProducerState::Scheduled(wd.clone())));

        p.admit(t);
        let t = p.input.try_pop().unwrap();
        p.finish_done(t);
        assert_eq!(p.producer(&id), Some(ProducerState::Done(wd)));
    }
}
