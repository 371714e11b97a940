use super::command::Command;
use super::view::ViewState;

/// One navigation entry: the command that created it plus the view state
/// it renders through.
pub struct Page {
    pub cmd: Command,
    pub view: ViewState,
}

impl Page {
    fn new(cmd: Command) -> Page {
        let view = ViewState::for_command(&cmd);
        Page { cmd, view }
    }
}

/// The navigation stack. Conceptually a doubly-linked list anchored at
/// the home page; here a vector whose prev/next are indices, with the
/// current and queued-to-run entries as optional indices.
#[derive(Default)]
pub struct PageStack {
    pages: Vec<Page>,
    cur: Option<usize>,
    next_run: Option<usize>,
}

impl PageStack {
    pub fn new() -> PageStack {
        PageStack::default()
    }

    /// Append a new page after the current one, dropping all of the
    /// current page's successors, and queue it for execution.
    pub fn create(&mut self, cmd: Command) -> usize {
        match self.cur {
            Some(cur) => self.pages.truncate(cur + 1),
            None => self.pages.clear(),
        }

        self.pages.push(Page::new(cmd));
        let idx = self.pages.len() - 1;
        self.next_run = Some(idx);
        idx
    }

    pub fn clear(&mut self) {
        self.pages.clear();
        self.cur = None;
        self.next_run = None;
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, idx: usize) -> Option<&Page> {
        self.pages.get(idx)
    }

    pub fn page_mut(&mut self, idx: usize) -> Option<&mut Page> {
        self.pages.get_mut(idx)
    }

    pub fn current(&self) -> Option<&Page> {
        self.cur.and_then(|idx| self.pages.get(idx))
    }

    pub fn current_index(&self) -> Option<usize> {
        self.cur
    }

    pub fn set_current(&mut self, idx: usize) {
        self.cur = Some(idx);
    }

    pub fn next_run(&self) -> Option<usize> {
        self.next_run
    }

    pub fn set_next_run(&mut self, idx: usize) {
        self.next_run = Some(idx);
    }

    pub fn clear_next_run(&mut self) {
        self.next_run = None;
    }

    /// Step back to the previous page, dropping everything after it.
    /// Returns the index to re-execute, or None on the home page.
    pub fn back(&mut self) -> Option<usize> {
        let cur = self.cur?;
        if cur == 0 {
            return None;
        }

        let prev = cur - 1;
        self.pages.truncate(prev + 1);
        self.cur = Some(prev);
        self.next_run = Some(prev);
        Some(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_next(stack: &mut PageStack) {
        // The execute path outside rendering: current advances to the
        // queued page and the queue empties.
        if let Some(next) = stack.next_run() {
            stack.set_current(next);
            stack.clear_next_run();
        }
    }

    #[test]
    fn push_then_back_restores_original() {
        let mut stack = PageStack::new();
        stack.create(Command::Home);
        run_next(&mut stack);
        let home = stack.current_index().unwrap();

        stack.create(Command::Monitor { pid: 100, tid: 0 });
        run_next(&mut stack);
        assert_ne!(stack.current_index().unwrap(), home);

        stack.back();
        run_next(&mut stack);
        assert_eq!(stack.current_index().unwrap(), home);
    }

    #[test]
    fn push_push_back_back_restores_original() {
        let mut stack = PageStack::new();
        stack.create(Command::Home);
        run_next(&mut stack);
        let home = stack.current_index().unwrap();

        stack.create(Command::Monitor { pid: 100, tid: 0 });
        run_next(&mut stack);
        stack.create(Command::CallChain { pid: 100, tid: 0 });
        run_next(&mut stack);
        assert_eq!(stack.len(), 3);

        stack.back();
        run_next(&mut stack);
        stack.back();
        run_next(&mut stack);
        assert_eq!(stack.current_index().unwrap(), home);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn back_on_home_is_a_no_op() {
        let mut stack = PageStack::new();
        stack.create(Command::Home);
        run_next(&mut stack);
        assert!(stack.back().is_none());
        assert_eq!(stack.current_index(), Some(0));
    }

    #[test]
    fn push_drops_successors_of_current() {
        let mut stack = PageStack::new();
        stack.create(Command::Home);
        run_next(&mut stack);
        stack.create(Command::NodeOverview);
        run_next(&mut stack);
        stack.back();
        run_next(&mut stack);

        stack.create(Command::Monitor { pid: 5, tid: 0 });
        run_next(&mut stack);
        assert_eq!(stack.len(), 2);
        assert!(matches!(
            stack.current().unwrap().cmd,
            Command::Monitor { pid: 5, .. }
        ));
    }

    #[test]
    fn home_from_any_depth_yields_single_page() {
        let mut stack = PageStack::new();
        stack.create(Command::Home);
        run_next(&mut stack);
        stack.create(Command::NodeOverview);
        run_next(&mut stack);
        stack.create(Command::NodeDetail { nid: 0 });
        run_next(&mut stack);

        // The home operation empties the list and starts over.
        stack.clear();
        stack.create(Command::Home);
        run_next(&mut stack);
        assert_eq!(stack.len(), 1);
        assert_eq!(stack.current_index(), Some(0));
    }
}
