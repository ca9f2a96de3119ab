use crate::value::closure::{FunctionKind, FunctionObject, Upvalue, UserdataObject};
use crate::value::string::StringObject;
use crate::value::table::TableObject;
use crate::value::value::{FunctionRef, StringRef, TableRef, ThreadRef, UpvalueRef, UserdataRef, Value};
use crate::vm::frame::ThreadObject;
use std::collections::HashMap;

/// Allocations between collection safepoints.
const GC_ALLOC_INTERVAL: usize = 4096;

#[derive(Debug)]
struct Arena<T> {
    slots: Vec<Option<T>>,
    free: Vec<u32>,
}

impl<T> Arena<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> u32 {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn get(&self, index: u32) -> &T {
        self.slots[index as usize]
            .as_ref()
            .expect("dangling heap handle")
    }

    fn get_mut(&mut self, index: u32) -> &mut T {
        self.slots[index as usize]
            .as_mut()
            .expect("dangling heap handle")
    }

    fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn sweep(&mut self, marks: &[bool]) -> usize {
        let mut freed = 0;
        for index in 0..self.slots.len() {
            if self.slots[index].is_some() && !marks[index] {
                self.slots[index] = None;
                self.free.push(index as u32);
                freed += 1;
            }
        }
        freed
    }
}

/// Everything the collector must treat as live. The engine assembles this
/// at each safepoint: globals, registry tables, identity stack context,
/// every active execution state, and any in-flight error payload.
#[derive(Debug, Default)]
pub struct GcRoots {
    pub values: Vec<Value>,
    pub upvalues: Vec<UpvalueRef>,
}

/// The engine-owned object heap: one arena per object kind, a string
/// intern table, and a mark-sweep collector over the lot.
#[derive(Debug)]
pub struct Heap {
    strings: Arena<StringObject>,
    tables: Arena<TableObject>,
    functions: Arena<FunctionObject>,
    userdata: Arena<UserdataObject>,
    threads: Arena<ThreadObject>,
    upvalues: Arena<Upvalue>,
    intern: HashMap<Box<[u8]>, StringRef>,
    allocs_since_gc: usize,
}

struct Marks {
    strings: Vec<bool>,
    tables: Vec<bool>,
    functions: Vec<bool>,
    userdata: Vec<bool>,
    threads: Vec<bool>,
    upvalues: Vec<bool>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            strings: Arena::new(),
            tables: Arena::new(),
            functions: Arena::new(),
            userdata: Arena::new(),
            threads: Arena::new(),
            upvalues: Arena::new(),
            intern: HashMap::new(),
            allocs_since_gc: 0,
        }
    }

    // ----- strings -----

    pub fn intern(&mut self, bytes: &[u8]) -> StringRef {
        if let Some(r) = self.intern.get(bytes) {
            return *r;
        }
        self.allocs_since_gc += 1;
        let r = StringRef(self.strings.insert(StringObject::new(bytes.to_vec())));
        self.intern.insert(bytes.into(), r);
        r
    }

    pub fn new_string(&mut self, s: &str) -> StringRef {
        self.intern(s.as_bytes())
    }

    pub fn string(&self, r: StringRef) -> &StringObject {
        self.strings.get(r.0)
    }

    pub fn string_bytes(&self, r: StringRef) -> &[u8] {
        self.strings.get(r.0).as_bytes()
    }

    pub fn string_lossy(&self, r: StringRef) -> String {
        self.strings.get(r.0).to_string_lossy().into_owned()
    }

    // ----- tables -----

    pub fn new_table(&mut self) -> TableRef {
        self.allocs_since_gc += 1;
        TableRef(self.tables.insert(TableObject::new()))
    }

    pub fn new_table_with_capacity(&mut self, array: usize, hash: usize) -> TableRef {
        self.allocs_since_gc += 1;
        TableRef(self.tables.insert(TableObject::with_capacity(array, hash)))
    }

    pub fn table(&self, r: TableRef) -> &TableObject {
        self.tables.get(r.0)
    }

    pub fn table_mut(&mut self, r: TableRef) -> &mut TableObject {
        self.tables.get_mut(r.0)
    }

    // ----- functions -----

    pub fn new_function(&mut self, function: FunctionObject) -> FunctionRef {
        self.allocs_since_gc += 1;
        FunctionRef(self.functions.insert(function))
    }

    pub fn function(&self, r: FunctionRef) -> &FunctionObject {
        self.functions.get(r.0)
    }

    // ----- userdata -----

    pub fn new_userdata(&mut self, userdata: UserdataObject) -> UserdataRef {
        self.allocs_since_gc += 1;
        UserdataRef(self.userdata.insert(userdata))
    }

    pub fn userdata(&self, r: UserdataRef) -> &UserdataObject {
        self.userdata.get(r.0)
    }

    pub fn userdata_mut(&mut self, r: UserdataRef) -> &mut UserdataObject {
        self.userdata.get_mut(r.0)
    }

    // ----- threads -----

    pub fn new_thread(&mut self, thread: ThreadObject) -> ThreadRef {
        self.allocs_since_gc += 1;
        ThreadRef(self.threads.insert(thread))
    }

    pub fn thread(&self, r: ThreadRef) -> &ThreadObject {
        self.threads.get(r.0)
    }

    pub fn thread_mut(&mut self, r: ThreadRef) -> &mut ThreadObject {
        self.threads.get_mut(r.0)
    }

    /// Handles of all live thread objects.
    pub fn live_threads(&self) -> Vec<ThreadRef> {
        (0..self.threads.slots.len())
            .filter(|i| self.threads.slots[*i].is_some())
            .map(|i| ThreadRef(i as u32))
            .collect()
    }

    // ----- upvalues -----

    pub fn new_upvalue(&mut self, upvalue: Upvalue) -> UpvalueRef {
        self.allocs_since_gc += 1;
        UpvalueRef(self.upvalues.insert(upvalue))
    }

    pub fn upvalue(&self, r: UpvalueRef) -> &Upvalue {
        self.upvalues.get(r.0)
    }

    pub fn upvalue_mut(&mut self, r: UpvalueRef) -> &mut Upvalue {
        self.upvalues.get_mut(r.0)
    }

    // ----- collection -----

    pub fn should_collect(&self) -> bool {
        self.allocs_since_gc >= GC_ALLOC_INTERVAL
    }

    pub fn live_object_count(&self) -> usize {
        self.strings.live_count()
            + self.tables.live_count()
            + self.functions.live_count()
            + self.userdata.live_count()
            + self.threads.live_count()
            + self.upvalues.live_count()
    }

    /// Mark from the root set, then sweep every arena. Returns the number
    /// of reclaimed objects.
    pub fn collect(&mut self, roots: &GcRoots) -> usize {
        self.allocs_since_gc = 0;
        let mut marks = Marks {
            strings: vec![false; self.strings.slots.len()],
            tables: vec![false; self.tables.slots.len()],
            functions: vec![false; self.functions.slots.len()],
            userdata: vec![false; self.userdata.slots.len()],
            threads: vec![false; self.threads.slots.len()],
            upvalues: vec![false; self.upvalues.slots.len()],
        };

        let mut work: Vec<Value> = roots.values.clone();
        let mut upvalue_work: Vec<UpvalueRef> = roots.upvalues.clone();

        loop {
            if let Some(value) = work.pop() {
                self.mark_value(value, &mut marks, &mut work, &mut upvalue_work);
                continue;
            }
            if let Some(r) = upvalue_work.pop() {
                if !marks.upvalues[r.index()] {
                    marks.upvalues[r.index()] = true;
                    if let Upvalue::Closed(v) = self.upvalues.get(r.0) {
                        work.push(*v);
                    }
                }
                continue;
            }
            break;
        }

        let mut freed = 0;
        freed += self.strings.sweep(&marks.strings);
        freed += self.tables.sweep(&marks.tables);
        freed += self.functions.sweep(&marks.functions);
        freed += self.userdata.sweep(&marks.userdata);
        freed += self.threads.sweep(&marks.threads);
        freed += self.upvalues.sweep(&marks.upvalues);
        self.intern.retain(|_, r| marks.strings[r.index()]);
        freed
    }

    fn mark_value(
        &self,
        value: Value,
        marks: &mut Marks,
        work: &mut Vec<Value>,
        upvalue_work: &mut Vec<UpvalueRef>,
    ) {
        match value {
            Value::Nil | Value::Bool(_) | Value::Integer(_) | Value::Number(_)
            | Value::LightUserdata(_) => {}
            Value::String(r) => {
                marks.strings[r.index()] = true;
            }
            Value::Table(r) => {
                if marks.tables[r.index()] {
                    return;
                }
                marks.tables[r.index()] = true;
                let table = self.tables.get(r.0);
                work.extend(table.array_part().iter().copied());
                for (k, v) in table.hash_part() {
                    work.push(k.to_value());
                    work.push(*v);
                }
                if let Some(mt) = table.metatable() {
                    work.push(Value::Table(mt));
                }
            }
            Value::Function(r) => {
                if marks.functions[r.index()] {
                    return;
                }
                marks.functions[r.index()] = true;
                match &self.functions.get(r.0).kind {
                    FunctionKind::Lua(closure) => {
                        upvalue_work.extend(closure.upvalues.iter().copied());
                    }
                    FunctionKind::Native(closure) => {
                        work.extend(closure.captures.iter().copied());
                    }
                }
            }
            Value::Userdata(r) => {
                if marks.userdata[r.index()] {
                    return;
                }
                marks.userdata[r.index()] = true;
                if let Some(mt) = self.userdata.get(r.0).metatable {
                    work.push(Value::Table(mt));
                }
            }
            Value::Thread(r) => {
                if marks.threads[r.index()] {
                    return;
                }
                marks.threads[r.index()] = true;
                let thread = self.threads.get(r.0);
                if let Some(body) = thread.body {
                    work.push(Value::Function(body));
                }
                if let Some(exec) = &thread.exec {
                    work.extend(exec.stack.iter().copied());
                    for frame in &exec.frames {
                        work.push(Value::Function(frame.func));
                    }
                    upvalue_work.extend(exec.open_upvalues.iter().map(|(_, r)| *r));
                }
            }
        }
    }
}
