pub mod descriptor_heap;
