use crate::constants::GC_HEAP_GROW_FACTOR;
use crate::objects::object::{Object, ObjectType};
use crate::objects::object_bound_method::ObjectBoundMethod;
use crate::objects::object_class::ObjectClass;
use crate::objects::object_closure::ObjectClosure;
use crate::objects::object_function::ObjectFunction;
use crate::objects::object_instance::ObjectInstance;
use crate::objects::object_upvalue::ObjectUpvalue;
use crate::vm::Vm;

/// Aggregated GC statistics (currently-live bytes are tracked by the heap).
#[derive(Default, Debug, Clone)]
pub struct GcStats {
    pub cycles: u64,
    pub total_freed_bytes: usize,
    pub last_freed_bytes: usize,
    pub last_before_bytes: usize,
    pub last_after_bytes: usize,
    pub last_next_trigger_bytes: usize,
}

impl GcStats {
    pub fn record(&mut self, before: usize, freed: usize, after: usize, next_trigger: usize) {
        self.cycles += 1;
        self.total_freed_bytes += freed;
        self.last_freed_bytes = freed;
        self.last_before_bytes = before;
        self.last_after_bytes = after;
        self.last_next_trigger_bytes = next_trigger;
    }
}

// Lightweight tracing macro (only active with the gc_debug feature).
#[cfg(feature = "gc_debug")]
macro_rules! gc_trace { ($($arg:tt)*) => { eprintln!("[gc-trace] {}", format_args!($($arg)*)); } }
#[cfg(not(feature = "gc_debug"))]
macro_rules! gc_trace { ($($arg:tt)*) => {{ }} }
pub(crate) use gc_trace;

/// Tricolor mark–sweep. White is the cleared mark flag, gray is membership
/// in the heap's worklist, black is marked-and-drained. Collection runs at
/// allocation points only, so every routine that allocates twice keeps its
/// first allocation reachable from a root in between.
impl Vm {
    pub fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated;
        gc_trace!("-- gc begin ({} bytes)", before);

        self.mark_roots();
        self.trace_references();
        // The intern table holds every live string but must not keep any
        // alive: drop the entries whose keys the trace never reached.
        self.strings.remove_white();
        let freed = self.heap.sweep();

        self.heap.next_gc = self.heap.bytes_allocated * GC_HEAP_GROW_FACTOR;
        let after = self.heap.bytes_allocated;
        self.heap
            .stats
            .record(before, freed, after, self.heap.next_gc);
        gc_trace!(
            "-- gc end (freed {}, {} -> {}, next at {})",
            freed,
            before,
            after,
            self.heap.next_gc
        );
    }

    fn mark_roots(&mut self) {
        for index in 0..self.stack_top {
            let value = self.stack[index];
            self.heap.mark_value(&value);
        }

        for index in 0..self.frames.len() {
            let closure = self.frames[index].closure;
            self.heap.mark_object(closure as *mut Object);
        }

        let mut upvalue = self.open_upvalues;
        while !upvalue.is_null() {
            self.heap.mark_object(upvalue as *mut Object);
            upvalue = unsafe { (*upvalue).next };
        }

        self.globals.mark(&mut self.heap);
        self.mark_compiler_roots();

        if !self.init_string.is_null() {
            self.heap.mark_object(self.init_string as *mut Object);
        }
    }

    /// In-flight compilations park their function objects on this stack so a
    /// collection triggered mid-compile cannot free them or their constants.
    fn mark_compiler_roots(&mut self) {
        for index in 0..self.compiler_roots.len() {
            let function = self.compiler_roots[index];
            self.heap.mark_object(function as *mut Object);
        }
    }

    fn trace_references(&mut self) {
        while let Some(object) = self.heap.gray_stack.pop() {
            self.blacken_object(object);
        }
    }

    fn blacken_object(&mut self, object: *mut Object) {
        gc_trace!("blacken {:p} ({:?})", object, unsafe { (*object).obj_type });
        match unsafe { (*object).obj_type } {
            ObjectType::ObjString | ObjectType::ObjNativeFunction => {}
            ObjectType::ObjFunction => {
                let function = unsafe { &*(object as *mut ObjectFunction) };
                for constant in function.chunk.iter_constants() {
                    self.heap.mark_value(constant);
                }
            }
            ObjectType::ObjClosure => {
                let closure = unsafe { &*(object as *mut ObjectClosure) };
                self.heap.mark_object(closure.function as *mut Object);
                for upvalue in closure.upvalues.iter() {
                    self.heap.mark_object(*upvalue as *mut Object);
                }
            }
            ObjectType::ObjUpvalue => {
                // While open, `closed` is nil and the referenced stack slot
                // is already a root.
                let closed = unsafe { (*(object as *mut ObjectUpvalue)).closed };
                self.heap.mark_value(&closed);
            }
            ObjectType::ObjClass => {
                let class = unsafe { &*(object as *mut ObjectClass) };
                class.methods.mark(&mut self.heap);
            }
            ObjectType::ObjInstance => {
                let instance = unsafe { &*(object as *mut ObjectInstance) };
                self.heap.mark_object(instance.class as *mut Object);
                instance.fields.mark(&mut self.heap);
            }
            ObjectType::ObjBoundMethod => {
                let bound = unsafe { &*(object as *mut ObjectBoundMethod) };
                let receiver = bound.receiver;
                self.heap.mark_value(&receiver);
                self.heap.mark_object(bound.method as *mut Object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_string::hash_string;
    use crate::value::Value;
    use crate::vm::InterpretResult;

    #[test]
    fn test_collect_frees_unreachable_strings() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("var keep = \"kept\" + \"alive\"; var temp = \"dead\" + \"weight\"; temp = nil;"),
            InterpretResult::InterpretOk
        );
        vm.collect_garbage();

        // The concatenation result that became unreachable is gone from the
        // weak intern table; the rooted one survived.
        assert!(vm
            .strings
            .find_string("deadweight", hash_string("deadweight"))
            .is_none());
        assert!(vm
            .strings
            .find_string("keptalive", hash_string("keptalive"))
            .is_some());
        assert!(vm.get_global("keep").is_some());
    }

    #[test]
    fn test_reinterning_after_collection_allocates_again() {
        let mut vm = Vm::new();
        vm.interpret("var t = \"long gone string body\"; t = nil;");
        vm.collect_garbage();

        let before = vm.heap.bytes_allocated;
        vm.copy_string("long gone string body");
        assert!(vm.heap.bytes_allocated > before);
    }

    #[test]
    fn test_collect_keeps_globals_and_their_contents() {
        let mut vm = Vm::new();
        vm.interpret("class Box { init(v) { this.v = v; } } var box = Box(\"payload\");");
        // The first cycle reclaims the finished top-level closure; after
        // that, everything left is reachable from the globals and stays put.
        vm.collect_garbage();
        let live = vm.heap.object_count();
        vm.collect_garbage();
        assert_eq!(vm.heap.object_count(), live);
        assert_eq!(
            vm.interpret("var out = box.v;"),
            InterpretResult::InterpretOk
        );
        let payload = vm.copy_string("payload");
        assert_eq!(
            vm.get_global("out"),
            Some(Value::Obj(payload as *mut crate::objects::object::Object))
        );
    }

    #[test]
    fn test_stats_record_cycles() {
        let mut vm = Vm::new();
        let cycles = vm.heap.stats.cycles;
        vm.collect_garbage();
        assert_eq!(vm.heap.stats.cycles, cycles + 1);
        assert_eq!(
            vm.heap.stats.last_next_trigger_bytes,
            vm.heap.next_gc
        );
    }

    #[test]
    fn test_stress_mode_does_not_change_results() {
        let source = "fun adder(n) { fun add(m) { return n + m; } return add; } var add2 = adder(2); var r = add2(40);";
        let mut plain = Vm::new();
        assert_eq!(plain.interpret(source), InterpretResult::InterpretOk);

        let mut stressed = Vm::new();
        stressed.set_gc_stress(true);
        assert_eq!(stressed.interpret(source), InterpretResult::InterpretOk);

        assert_eq!(plain.get_global("r"), Some(Value::Number(42.0)));
        assert_eq!(stressed.get_global("r"), Some(Value::Number(42.0)));
    }

    #[test]
    fn test_collect_during_compile_keeps_in_flight_constants() {
        let mut vm = Vm::new();
        vm.set_gc_stress(true);
        // Every identifier and literal interned mid-compile triggers a
        // collection; the compiler-root stack has to keep them reachable.
        assert_eq!(
            vm.interpret("fun greet(name) { return \"hello \" + name; } var r = greet(\"world\");"),
            InterpretResult::InterpretOk
        );
        let expected = vm.copy_string("hello world");
        assert_eq!(
            vm.get_global("r"),
            Some(Value::Obj(expected as *mut Object))
        );
    }
}
